//! Wiring of the core services into one running engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use clipline_core::{
    executor::handlers::{builtin_registry, HandlerDeps},
    AuditHandle, AuditStore, AutoApprover, CatalogStore, Config, DailyPlanner, Dispatcher,
    MediaTool, Orchestrator, PipelineExecutor, PublishService, PublisherRegistry,
    ScheduledPublisher, Selector, Sleeper, SqliteCatalog, SqliteTaskStore, TaskControl,
    TaskProcessor, TaskStore, TokioSleeper, Watchdog, WorkerPool,
};

/// Everything the HTTP layer needs from the core.
pub struct Engine {
    pub tasks: Arc<dyn TaskStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub control: TaskControl,
    pub planner: DailyPlanner,
    pub orchestrator: Arc<Orchestrator>,
}

/// External boundaries, injectable so tests can swap in mocks.
pub struct EngineDeps {
    pub media: Arc<dyn MediaTool>,
    pub adapters: PublisherRegistry,
}

impl EngineDeps {
    /// ffmpeg from `[media]` and every built-in platform adapter.
    pub fn from_config(config: &Config) -> Result<Self> {
        let adapters = PublisherRegistry::from_config(&config.platforms)
            .context("Failed to create publisher adapters")?;
        Ok(Self {
            media: Arc::new(clipline_core::FfmpegTool::new(config.media.clone())),
            adapters,
        })
    }
}

/// Open the stores and build every service on top of them.
///
/// Loops are not started; call [`Orchestrator::start`] when
/// `config.orchestrator.enabled` is set.
pub fn build_engine(
    config: &Config,
    deps: EngineDeps,
    audit: AuditHandle,
    audit_store: Arc<dyn AuditStore>,
) -> Result<Engine> {
    let tasks: Arc<dyn TaskStore> = Arc::new(
        SqliteTaskStore::new(&config.database.path).context("Failed to create task store")?,
    );
    let catalog: Arc<dyn CatalogStore> = Arc::new(
        SqliteCatalog::new(&config.database.path).context("Failed to create catalog")?,
    );
    info!("Stores initialized at {:?}", config.database.path);

    // Flipped on shutdown so retry backoff and publish jitter stop waiting.
    let (sleep_signal, sleep_rx) = watch::channel(false);
    let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper::new(sleep_rx));
    let selector = Selector::new(config.selector.clone());

    info!("Publisher adapters: {:?}", deps.adapters.platforms());
    let publish = Arc::new(PublishService::new(
        Arc::clone(&tasks),
        Arc::clone(&catalog),
        Arc::new(deps.adapters),
        Arc::clone(&sleeper),
        config.publisher.clone(),
    ));

    let handlers = builtin_registry(&HandlerDeps {
        media: deps.media,
        http: reqwest::Client::new(),
        sleeper: Arc::clone(&sleeper),
        publish: Some(Arc::clone(&publish)),
    });
    let executor = PipelineExecutor::new(
        Arc::new(handlers),
        Duration::from_secs(config.pipeline.step_timeout_secs),
    )
    .with_control(Arc::clone(&tasks));

    let processor = TaskProcessor::new(
        Arc::clone(&tasks),
        Arc::clone(&catalog),
        Arc::new(executor),
        config.pipeline.clone(),
    )
    .with_audit(audit.clone());
    let pool = Arc::new(WorkerPool::new(
        Arc::new(processor),
        config.dispatcher.max_parallel,
    ));

    let dispatcher = Dispatcher::new(
        Arc::clone(&tasks),
        Arc::clone(&catalog),
        config.dispatcher.clone(),
    )
    .with_pool(Arc::clone(&pool))
    .with_audit(audit.clone());

    let publisher = ScheduledPublisher::new(
        Arc::clone(&tasks),
        Arc::clone(&catalog),
        publish,
        sleeper,
        selector.clone(),
        config.pipeline.clone(),
    )
    .with_audit(audit.clone());

    let watchdog = Watchdog::new(Arc::clone(&tasks), config.watchdog.clone())
        .with_audit(audit.clone())
        .with_audit_store(audit_store);

    let approver = AutoApprover::new(Arc::clone(&tasks), Arc::clone(&catalog), selector.clone())
        .with_audit(audit.clone());

    let orchestrator = Orchestrator::new(
        config.orchestrator.clone(),
        Arc::new(dispatcher),
        Arc::new(publisher),
        Arc::new(watchdog),
        Arc::new(approver),
    )
    .with_pool(pool)
    .with_sleep_signal(sleep_signal);

    let control = TaskControl::new(Arc::clone(&tasks)).with_audit(audit.clone());
    let planner = DailyPlanner::new(Arc::clone(&tasks), Arc::clone(&catalog), selector)
        .with_audit(audit);

    Ok(Engine {
        tasks,
        catalog,
        control,
        planner,
        orchestrator: Arc::new(orchestrator),
    })
}
