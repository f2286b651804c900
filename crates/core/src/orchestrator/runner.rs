//! Control-loop driver.
//!
//! Each loop is a tokio task that wakes up on its interval and runs one pass.
//! Passes of the same loop never overlap: a per-loop async mutex is held for
//! the whole pass, and a trigger that finds it taken reports the loop busy.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::approve::{ApproveRunReport, AutoApprover};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::metrics;
use crate::processor::WorkerPool;
use crate::schedule::{PublishRunReport, ScheduledPublisher};
use crate::watchdog::{Watchdog, WatchdogHealth, WatchdogReport};

use super::config::OrchestratorConfig;
use super::types::{LoopKind, LoopRun, LoopStatus, OrchestratorError, OrchestratorStatus};

#[derive(Default)]
struct LoopLocks {
    dispatch: Mutex<()>,
    publish: Mutex<()>,
    watchdog: Mutex<()>,
    approve: Mutex<()>,
}

impl LoopLocks {
    fn get(&self, kind: LoopKind) -> &Mutex<()> {
        match kind {
            LoopKind::Dispatch => &self.dispatch,
            LoopKind::Publish => &self.publish,
            LoopKind::Watchdog => &self.watchdog,
            LoopKind::Approve => &self.approve,
        }
    }
}

/// Drives the dispatcher, the scheduled publisher, the watchdog and
/// auto-approve.
pub struct Orchestrator {
    config: OrchestratorConfig,
    dispatcher: Arc<Dispatcher>,
    publisher: Arc<ScheduledPublisher>,
    watchdog: Arc<Watchdog>,
    approver: Arc<AutoApprover>,
    pool: Option<Arc<WorkerPool>>,
    /// Flipped on shutdown so in-flight backoff and jitter sleeps abort.
    sleep_signal: Option<watch::Sender<bool>>,

    // Runtime state
    locks: LoopLocks,
    last_runs: RwLock<BTreeMap<LoopKind, LoopRun>>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        dispatcher: Arc<Dispatcher>,
        publisher: Arc<ScheduledPublisher>,
        watchdog: Arc<Watchdog>,
        approver: Arc<AutoApprover>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            dispatcher,
            publisher,
            watchdog,
            approver,
            pool: None,
            sleep_signal: None,
            locks: LoopLocks::default(),
            last_runs: RwLock::new(BTreeMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            handles: StdMutex::new(Vec::new()),
        }
    }

    /// Pool drained on shutdown and reported in the status.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sender whose receivers back the `TokioSleeper`s of the publish path.
    pub fn with_sleep_signal(mut self, signal: watch::Sender<bool>) -> Self {
        self.sleep_signal = Some(signal);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn interval(&self, kind: LoopKind) -> u64 {
        match kind {
            LoopKind::Dispatch => self.config.dispatch_interval_secs,
            LoopKind::Publish => self.config.publish_interval_secs,
            LoopKind::Watchdog => self.config.watchdog_interval_secs,
            LoopKind::Approve => self.config.approve_interval_secs,
        }
    }

    /// Start the periodic loops (spawns background tasks).
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return;
        }

        info!("Starting orchestrator");
        for kind in LoopKind::ALL {
            let interval = self.interval(kind);
            if interval == 0 {
                debug!(name = kind.as_str(), "Loop disabled");
                continue;
            }
            self.spawn_loop(kind, Duration::from_secs(interval));
        }
        info!("Orchestrator started");
    }

    fn spawn_loop(self: &Arc<Self>, kind: LoopKind, interval: Duration) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            info!(name = kind.as_str(), interval_secs = interval.as_secs(), "Loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(name = kind.as_str(), "Loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !this.running.load(Ordering::Relaxed) {
                            break;
                        }
                        match this.run_loop(kind).await {
                            Ok(()) => {}
                            Err(OrchestratorError::Busy(_)) => {
                                debug!(name = kind.as_str(), "Previous pass still running, skipping");
                            }
                            Err(e) => warn!(name = kind.as_str(), error = %e, "Loop pass failed"),
                        }
                    }
                }
            }
            info!(name = kind.as_str(), "Loop stopped");
        });

        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }
    }

    async fn run_loop(&self, kind: LoopKind) -> Result<(), OrchestratorError> {
        match kind {
            LoopKind::Dispatch => self.run_dispatch(false).await.map(|_| ()),
            LoopKind::Publish => self.run_publish(false).await.map(|_| ()),
            LoopKind::Watchdog => self.run_watchdog(false).await.map(|_| ()),
            LoopKind::Approve => self.run_auto_approve(false).await.map(|_| ()),
        }
    }

    /// Stop the loops, abort pending sleeps and drain the worker pool.
    ///
    /// Returns false when something was still running at the grace deadline.
    pub async fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Orchestrator not running");
        }

        info!("Stopping orchestrator");
        let _ = self.shutdown_tx.send(());
        if let Some(ref signal) = self.sleep_signal {
            let _ = signal.send(true);
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        let mut clean = tokio::time::timeout(grace, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if let Some(ref pool) = self.pool {
            clean &= pool.drain(grace).await;
        }

        info!(clean, "Orchestrator stopped");
        clean
    }

    /// Run `pass` under the loop's mutex, recording metrics and the outcome.
    async fn guarded<T, E, F, Fut>(&self, kind: LoopKind, pass: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        OrchestratorError: From<E>,
    {
        let Ok(_guard) = self.locks.get(kind).try_lock() else {
            metrics::LOOP_RUNS_TOTAL
                .with_label_values(&[kind.as_str(), "busy"])
                .inc();
            return Err(OrchestratorError::Busy(kind));
        };

        let at = Utc::now();
        let started = Instant::now();
        let result = pass().await.map_err(OrchestratorError::from);
        let elapsed = started.elapsed();

        metrics::LOOP_DURATION_SECONDS
            .with_label_values(&[kind.as_str()])
            .observe(elapsed.as_secs_f64());
        metrics::LOOP_RUNS_TOTAL
            .with_label_values(&[kind.as_str(), if result.is_ok() { "ok" } else { "error" }])
            .inc();

        let run = LoopRun {
            at,
            ok: result.is_ok(),
            duration_ms: elapsed.as_millis() as u64,
            error: result.as_ref().err().map(ToString::to_string),
        };
        self.last_runs.write().await.insert(kind, run);
        result
    }

    pub async fn run_dispatch(&self, dry_run: bool) -> Result<DispatchReport, OrchestratorError> {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.guarded(LoopKind::Dispatch, || async move {
            dispatcher.run_dispatch(dry_run).await
        })
        .await
    }

    pub async fn run_publish(&self, dry_run: bool) -> Result<PublishRunReport, OrchestratorError> {
        let publisher = Arc::clone(&self.publisher);
        self.guarded(LoopKind::Publish, || async move {
            publisher.run_publish(dry_run).await
        })
        .await
    }

    pub async fn run_watchdog(&self, dry_run: bool) -> Result<WatchdogReport, OrchestratorError> {
        let watchdog = Arc::clone(&self.watchdog);
        self.guarded(LoopKind::Watchdog, || async move {
            watchdog.run_watchdog(dry_run).await
        })
        .await
    }

    pub async fn run_auto_approve(
        &self,
        dry_run: bool,
    ) -> Result<ApproveRunReport, OrchestratorError> {
        let approver = Arc::clone(&self.approver);
        self.guarded(LoopKind::Approve, || async move {
            approver.run_auto_approve(dry_run).await
        })
        .await
    }

    pub fn watchdog_health(&self) -> Result<WatchdogHealth, OrchestratorError> {
        Ok(self.watchdog.health()?)
    }

    /// Get current orchestrator status.
    pub async fn status(&self) -> OrchestratorStatus {
        let last_runs = self.last_runs.read().await;
        let loops = LoopKind::ALL
            .iter()
            .map(|kind| {
                let status = LoopStatus {
                    interval_secs: self.interval(*kind),
                    busy: self.locks.get(*kind).try_lock().is_err(),
                    last_run: last_runs.get(kind).cloned(),
                };
                (kind.as_str().to_string(), status)
            })
            .collect();

        OrchestratorStatus {
            running: self.is_running(),
            loops,
            pool: self.pool.as_ref().map(|p| p.status()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogStore, Project, SqliteCatalog};
    use crate::dispatcher::DispatcherConfig;
    use crate::processor::ProcessorConfig;
    use crate::publisher::{PublishService, PublisherConfig, PublisherRegistry};
    use crate::selector::Selector;
    use crate::sleeper::TokioSleeper;
    use crate::task::{SqliteTaskStore, TaskFilter, TaskStatus, TaskStore};
    use crate::testing::fixtures;
    use crate::watchdog::WatchdogConfig;

    struct Harness {
        tasks: Arc<SqliteTaskStore>,
        orchestrator: Arc<Orchestrator>,
    }

    fn harness(config: OrchestratorConfig) -> Harness {
        let tasks = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let catalog = Arc::new(SqliteCatalog::in_memory().unwrap());
        let project = catalog.create_project(Project::new("p")).unwrap();
        catalog
            .create_destination(fixtures::destination(project.id, "youtube"))
            .unwrap();

        let (signal, rx) = watch::channel(false);
        let sleeper = Arc::new(TokioSleeper::new(rx));
        let service = Arc::new(PublishService::new(
            tasks.clone(),
            catalog.clone(),
            Arc::new(PublisherRegistry::new()),
            sleeper.clone(),
            PublisherConfig::default(),
        ));
        let dispatcher = Dispatcher::new(tasks.clone(), catalog.clone(), DispatcherConfig::default());
        let publisher = ScheduledPublisher::new(
            tasks.clone(),
            catalog.clone(),
            service,
            sleeper,
            Selector::default(),
            ProcessorConfig::default(),
        );
        let watchdog = Watchdog::new(tasks.clone(), WatchdogConfig::default());
        let approver = AutoApprover::new(tasks.clone(), catalog.clone(), Selector::default());

        let orchestrator = Orchestrator::new(
            config,
            Arc::new(dispatcher),
            Arc::new(publisher),
            Arc::new(watchdog),
            Arc::new(approver),
        )
        .with_sleep_signal(signal);

        Harness {
            tasks,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn on_demand() -> OrchestratorConfig {
        OrchestratorConfig {
            enabled: true,
            dispatch_interval_secs: 0,
            publish_interval_secs: 0,
            watchdog_interval_secs: 0,
            approve_interval_secs: 0,
            shutdown_grace_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_manual_dispatch_records_last_run() {
        let h = harness(on_demand());
        let task = h.tasks.create(fixtures::create_request(1, 1)).unwrap();

        let report = h.orchestrator.run_dispatch(false).await.unwrap();
        assert_eq!(report.started_count, 1);
        assert_eq!(
            h.tasks.get(task.id).unwrap().unwrap().status,
            TaskStatus::Processing
        );

        let status = h.orchestrator.status().await;
        assert!(!status.running);
        let dispatch = &status.loops["dispatch"];
        assert!(dispatch.last_run.as_ref().unwrap().ok);
        assert!(!dispatch.busy);
        assert!(status.loops["publish"].last_run.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_pass_reports_busy() {
        let h = harness(on_demand());
        let _held = h.orchestrator.locks.get(LoopKind::Watchdog).lock().await;

        let result = h.orchestrator.run_watchdog(false).await;
        assert!(matches!(result, Err(OrchestratorError::Busy(LoopKind::Watchdog))));
        assert!(h.orchestrator.status().await.loops["watchdog"].busy);

        // Other loops are independent.
        assert!(h.orchestrator.run_publish(true).await.is_ok());
    }

    #[tokio::test]
    async fn test_loops_run_until_stopped() {
        let mut config = on_demand();
        config.dispatch_interval_secs = 1;
        let h = harness(config);
        h.tasks.create(fixtures::create_request(1, 1)).unwrap();

        h.orchestrator.start();
        assert!(h.orchestrator.is_running());

        let processing = TaskFilter::new().with_status(TaskStatus::Processing);
        let mut dispatched = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if h.tasks.count(&processing).unwrap() == 1 {
                dispatched = true;
                break;
            }
        }
        assert!(dispatched);

        assert!(h.orchestrator.stop().await);
        assert!(!h.orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_watchdog_health_passthrough() {
        let h = harness(on_demand());
        h.tasks.create(fixtures::create_request(1, 1)).unwrap();
        let health = h.orchestrator.watchdog_health().unwrap();
        assert_eq!(health.counts["queued"], 1);
    }
}
