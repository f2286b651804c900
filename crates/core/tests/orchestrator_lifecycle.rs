//! Orchestrator lifecycle integration tests.
//!
//! These tests drive the control loops over a real SQLite database with
//! mocked step handlers and a scripted platform adapter.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

use clipline_core::{
    executor::HandlerRegistry,
    publisher::PublisherConfig,
    task::TaskUpdate,
    testing::{fixtures, MockPublisher, MockStepHandler, RecordingSleeper},
    AutoApprover, CatalogStore, Destination, Dispatcher, DispatcherConfig, Orchestrator,
    OrchestratorConfig, PipelineExecutor, ProcessorConfig, Project, PublishService,
    PublisherRegistry, ScheduledPublisher, Selector, SqliteCatalog, SqliteTaskStore, StepKind,
    TaskControl, TaskProcessor, TaskStatus, TaskStore, Watchdog, WatchdogConfig, WorkerPool,
};

/// Test helper wiring every loop of the orchestrator.
struct TestHarness {
    tasks: Arc<SqliteTaskStore>,
    orchestrator: Arc<Orchestrator>,
    project: Project,
    destination: Destination,
    processor_config: ProcessorConfig,
    _temp_dir: TempDir,
}

impl TestHarness {
    /// `step_delay` slows the crop step so a run can be caught in flight.
    fn new(config: OrchestratorConfig, step_delay: Option<Duration>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let tasks = Arc::new(SqliteTaskStore::new(&db_path).expect("Failed to create task store"));
        let catalog = Arc::new(SqliteCatalog::new(&db_path).expect("Failed to create catalog"));
        let project = catalog
            .create_project(Project::new("clips"))
            .expect("Failed to create project");
        let destination = catalog
            .create_destination(fixtures::destination(project.id, "youtube"))
            .expect("Failed to create destination");

        let processor_config = ProcessorConfig::default().with_work_dir(temp_dir.path().join("work"));

        let mut registry = HandlerRegistry::new();
        for tool_id in ["T02_PROBE", "T04_CROP_RESIZE", "T05_THUMBNAIL"] {
            let mut handler = MockStepHandler::ok(json!({ "ok": true }));
            if tool_id == "T04_CROP_RESIZE" {
                if let Some(delay) = step_delay {
                    handler = handler.with_delay(delay);
                }
            }
            registry.register(StepKind::from_tool_id(tool_id), Arc::new(handler));
        }
        let executor = PipelineExecutor::new(Arc::new(registry), Duration::from_secs(5))
            .with_control(tasks.clone());
        let processor = TaskProcessor::new(
            tasks.clone(),
            catalog.clone(),
            Arc::new(executor),
            processor_config.clone(),
        );
        let pool = Arc::new(WorkerPool::new(Arc::new(processor), 2));

        let dispatcher = Dispatcher::new(tasks.clone(), catalog.clone(), DispatcherConfig::default())
            .with_pool(pool.clone());

        let mut adapters = PublisherRegistry::new();
        adapters.register(Arc::new(MockPublisher::new("youtube")));
        let sleeper = Arc::new(RecordingSleeper::new());
        let service = PublishService::new(
            tasks.clone(),
            catalog.clone(),
            Arc::new(adapters),
            sleeper.clone(),
            PublisherConfig::default(),
        );
        let publisher = ScheduledPublisher::new(
            tasks.clone(),
            catalog.clone(),
            Arc::new(service),
            sleeper,
            Selector::default(),
            processor_config.clone(),
        );

        let watchdog = Watchdog::new(tasks.clone(), WatchdogConfig::default().with_thresholds(60, 30));
        let approver = AutoApprover::new(tasks.clone(), catalog.clone(), Selector::default());

        let orchestrator = Orchestrator::new(
            config,
            Arc::new(dispatcher),
            Arc::new(publisher),
            Arc::new(watchdog),
            Arc::new(approver),
        )
        .with_pool(pool);

        Self {
            tasks,
            orchestrator: Arc::new(orchestrator),
            project,
            destination,
            processor_config,
            _temp_dir: temp_dir,
        }
    }

    fn queued_task(&self) -> i64 {
        let task = self
            .tasks
            .create(fixtures::create_request(self.project.id, self.destination.id))
            .expect("Failed to create task");
        let task_dir = self.processor_config.task_dir(task.id);
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(task_dir.join("raw.mp4"), b"video").unwrap();
        task.id
    }

    fn status(&self, task_id: i64) -> TaskStatus {
        self.tasks.get(task_id).unwrap().unwrap().status
    }

    /// Poll until the task reaches `expected` or three seconds pass.
    async fn wait_for_status(&self, task_id: i64, expected: TaskStatus) -> bool {
        for _ in 0..150 {
            if self.status(task_id) == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

/// Dispatch every second; every other loop only runs on demand.
fn dispatch_only() -> OrchestratorConfig {
    OrchestratorConfig {
        enabled: true,
        dispatch_interval_secs: 1,
        publish_interval_secs: 0,
        watchdog_interval_secs: 0,
        approve_interval_secs: 0,
        shutdown_grace_secs: 5,
    }
}

#[tokio::test]
async fn test_periodic_dispatch_processes_queued_task() {
    let harness = TestHarness::new(dispatch_only(), None);
    let task_id = harness.queued_task();

    harness.orchestrator.start();
    assert!(harness.orchestrator.is_running());

    assert!(
        harness
            .wait_for_status(task_id, TaskStatus::ReadyForReview)
            .await,
        "task was not processed by the dispatch loop"
    );

    let status = harness.orchestrator.status().await;
    let dispatch = &status.loops["dispatch"];
    assert_eq!(dispatch.interval_secs, 1);
    assert!(dispatch.last_run.as_ref().is_some_and(|run| run.ok));
    assert_eq!(status.loops["publish"].interval_secs, 0);
    assert!(status.loops["publish"].last_run.is_none());

    assert!(harness.orchestrator.stop().await);
    assert!(!harness.orchestrator.is_running());
    assert_eq!(status.pool.map(|p| p.max_parallel), Some(2));
}

#[tokio::test]
async fn test_stop_without_start_is_clean() {
    let harness = TestHarness::new(dispatch_only(), None);

    assert!(harness.orchestrator.stop().await);
    assert!(!harness.orchestrator.is_running());
}

#[tokio::test]
async fn test_pause_requested_mid_run_parks_task() {
    let harness = TestHarness::new(
        OrchestratorConfig::default(),
        Some(Duration::from_millis(300)),
    );
    let task_id = harness.queued_task();

    let report = harness.orchestrator.run_dispatch(false).await.unwrap();
    assert_eq!(report.started_count, 1);
    assert!(harness.wait_for_status(task_id, TaskStatus::Processing).await);

    let control = TaskControl::new(harness.tasks.clone());
    let outcome = control
        .pause(task_id, Some("needs a new caption".to_string()))
        .await
        .unwrap();
    assert!(outcome.pending);
    assert_eq!(outcome.status, TaskStatus::Processing);

    assert!(harness.orchestrator.stop().await);

    let paused = harness.tasks.get(task_id).unwrap().unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert!(paused.lease.is_none());
    assert!(paused.paused_at.is_some());

    let resumed = control.resume(task_id).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Queued);
}

#[tokio::test]
async fn test_watchdog_pass_marks_stuck_task_as_error() {
    let harness = TestHarness::new(OrchestratorConfig::default(), None);
    let stuck = harness.queued_task();
    let fresh = harness.queued_task();
    harness
        .tasks
        .transition(
            stuck,
            TaskStatus::Processing,
            TaskUpdate::new().processing_started_at(Utc::now() - chrono::Duration::hours(3)),
        )
        .unwrap();
    harness
        .tasks
        .transition(
            fresh,
            TaskStatus::Processing,
            TaskUpdate::new().processing_started_at(Utc::now()),
        )
        .unwrap();

    let dry = harness.orchestrator.run_watchdog(true).await.unwrap();
    assert_eq!(dry.stuck_count, 1);
    assert_eq!(dry.items[0].action, "would_mark_error");
    assert_eq!(harness.status(stuck), TaskStatus::Processing);

    let report = harness.orchestrator.run_watchdog(false).await.unwrap();
    assert_eq!(report.stuck_processing, 1);
    assert_eq!(report.items[0].task_id, stuck);
    assert_eq!(report.items[0].action, "marked_error");
    assert_eq!(harness.status(stuck), TaskStatus::Error);
    assert_eq!(harness.status(fresh), TaskStatus::Processing);

    let health = harness.orchestrator.watchdog_health().unwrap();
    assert_eq!(health.counts["error"], 1);
    assert_eq!(health.stuck.processing, 0);
}
