//! Task lifecycle integration tests.
//!
//! A task is dispatched into the worker pool, processed through a mocked
//! step pipeline and published through a scripted adapter:
//! queued -> processing -> ready_for_publish -> publishing -> published

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use clipline_core::{
    executor::HandlerRegistry,
    publisher::{PublishResult, PublisherConfig},
    task::{ModerationMode, StepResultStatus},
    testing::{fixtures, MockPublisher, MockStepHandler, RecordingSleeper},
    CatalogStore, Destination, Dispatcher, DispatcherConfig, PipelineExecutor, Project,
    ProcessorConfig, PublishService, PublisherRegistry, SqliteCatalog, SqliteTaskStore,
    StepKind, TaskControl, TaskProcessor, TaskStatus, TaskStore, WorkerPool,
};

const DEFAULT_STEPS: [&str; 3] = ["T02_PROBE", "T04_CROP_RESIZE", "T05_THUMBNAIL"];

struct TestHarness {
    tasks: Arc<SqliteTaskStore>,
    catalog: Arc<SqliteCatalog>,
    project: Project,
    destination: Destination,
    work_dir: TempDir,
    _db_dir: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        let db_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = db_dir.path().join("test.db");

        let tasks = Arc::new(SqliteTaskStore::new(&db_path).expect("Failed to create task store"));
        let catalog = Arc::new(SqliteCatalog::new(&db_path).expect("Failed to create catalog"));
        let project = catalog
            .create_project(Project::new("clips"))
            .expect("Failed to create project");
        let destination = catalog
            .create_destination(fixtures::destination(project.id, "youtube"))
            .expect("Failed to create destination");

        Self {
            tasks,
            catalog,
            project,
            destination,
            work_dir: TempDir::new().expect("Failed to create work dir"),
            _db_dir: db_dir,
        }
    }

    fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig::default().with_work_dir(self.work_dir.path())
    }

    fn dispatcher(&self, registry: HandlerRegistry, limits: (usize, usize)) -> (Dispatcher, Arc<WorkerPool>) {
        let executor = PipelineExecutor::new(Arc::new(registry), Duration::from_secs(5))
            .with_control(self.tasks.clone());
        let processor = TaskProcessor::new(
            self.tasks.clone(),
            self.catalog.clone(),
            Arc::new(executor),
            self.processor_config(),
        );
        let pool = Arc::new(WorkerPool::new(Arc::new(processor), limits.0));
        let dispatcher = Dispatcher::new(
            self.tasks.clone(),
            self.catalog.clone(),
            DispatcherConfig::default().with_limits(limits.0, limits.1),
        )
        .with_pool(pool.clone());
        (dispatcher, pool)
    }

    /// A queued task whose raw video is already on disk.
    fn queued_task(&self, mode: ModerationMode) -> i64 {
        let mut request = fixtures::create_request(self.project.id, self.destination.id);
        request.moderation_mode = mode;
        let task = self.tasks.create(request).expect("Failed to create task");

        let task_dir = self.processor_config().task_dir(task.id);
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(task_dir.join("raw.mp4"), b"video").unwrap();
        task.id
    }

    fn status(&self, task_id: i64) -> TaskStatus {
        self.tasks.get(task_id).unwrap().unwrap().status
    }
}

fn registry(failing: Option<&str>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for tool_id in DEFAULT_STEPS {
        let handler = if Some(tool_id) == failing {
            MockStepHandler::failing("encoder crashed")
        } else {
            MockStepHandler::ok(json!({ "ok": true }))
        };
        registry.register(StepKind::from_tool_id(tool_id), Arc::new(handler));
    }
    registry
}

#[tokio::test]
async fn test_task_runs_from_queue_to_published() {
    let harness = TestHarness::new();
    let (dispatcher, pool) = harness.dispatcher(registry(None), (2, 1));
    let task_id = harness.queued_task(ModerationMode::Auto);

    let report = dispatcher.run_dispatch(false).await.unwrap();
    assert_eq!(report.started_count, 1);
    assert_eq!(report.started[0].task_id, task_id);
    assert!(report.started[0].lease_id.is_some());

    assert!(pool.drain(Duration::from_secs(5)).await);
    assert_eq!(pool.status().total_processed, 1);

    let processed = harness.tasks.get(task_id).unwrap().unwrap();
    assert_eq!(processed.status, TaskStatus::ReadyForPublish);
    assert!(processed.lease.is_none());
    assert_eq!(processed.total_steps, 3);
    assert_eq!(processed.dag_debug.len(), 3);

    // The first upload hits a transient error, the retry succeeds.
    let adapter = Arc::new(MockPublisher::new("youtube"));
    adapter.push_result(PublishResult::retryable("youtube", "HTTP 503"));
    let mut adapters = PublisherRegistry::new();
    adapters.register(adapter.clone());
    let sleeper = Arc::new(RecordingSleeper::new());
    let service = PublishService::new(
        harness.tasks.clone(),
        harness.catalog.clone(),
        Arc::new(adapters),
        sleeper.clone(),
        PublisherConfig::default(),
    );

    let task_dir = harness.processor_config().task_dir(task_id);
    let outcome = service.publish_task(task_id, &task_dir).await.unwrap();
    assert!(outcome.published);
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(sleeper.durations(), vec![Duration::from_secs(60)]);
    assert_eq!(adapter.call_count(), 2);

    let published = harness.tasks.get(task_id).unwrap().unwrap();
    assert_eq!(published.status, TaskStatus::Published);
    assert_eq!(
        published.published_url.as_deref(),
        Some(format!("https://youtube.test/{}", task_id).as_str())
    );

    // Publishing again is a no-op that reports the recorded location.
    let again = service.publish_task(task_id, &task_dir).await.unwrap();
    assert!(again.idempotent_skip);
    assert_eq!(again.published_url, published.published_url);
    assert_eq!(adapter.call_count(), 2);
}

#[tokio::test]
async fn test_manual_moderation_waits_for_review() {
    let harness = TestHarness::new();
    let (dispatcher, pool) = harness.dispatcher(registry(None), (2, 1));
    let task_id = harness.queued_task(ModerationMode::Manual);

    dispatcher.run_dispatch(false).await.unwrap();
    assert!(pool.drain(Duration::from_secs(5)).await);

    assert_eq!(harness.status(task_id), TaskStatus::ReadyForReview);
}

#[tokio::test]
async fn test_failed_step_errors_task_and_requeue_recovers_it() {
    let harness = TestHarness::new();
    let (dispatcher, pool) = harness.dispatcher(registry(Some("T04_CROP_RESIZE")), (2, 1));
    let task_id = harness.queued_task(ModerationMode::Auto);

    dispatcher.run_dispatch(false).await.unwrap();
    assert!(pool.drain(Duration::from_secs(5)).await);

    let failed = harness.tasks.get(task_id).unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Error);
    assert!(failed.error_message.is_some());
    assert!(failed.lease.is_none());

    let control = TaskControl::new(harness.tasks.clone());
    let outcome = control.requeue(task_id).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Queued);

    let requeued = harness.tasks.get(task_id).unwrap().unwrap();
    assert!(requeued.error_message.is_none());
}

#[tokio::test]
async fn test_destination_limit_keeps_second_task_queued() {
    let harness = TestHarness::new();
    let (dispatcher, pool) = harness.dispatcher(registry(None), (4, 1));
    let first = harness.queued_task(ModerationMode::Manual);
    let second = harness.queued_task(ModerationMode::Manual);

    let report = dispatcher.run_dispatch(false).await.unwrap();
    assert_eq!(report.started_count, 1);
    assert_eq!(report.skipped_count, 1);
    assert_eq!(report.concurrency.max_per_destination, 1);

    assert!(pool.drain(Duration::from_secs(5)).await);
    let statuses = [harness.status(first), harness.status(second)];
    assert!(statuses.contains(&TaskStatus::ReadyForReview));
    assert!(statuses.contains(&TaskStatus::Queued));

    // Once the first task left processing, the next pass admits the other.
    let report = dispatcher.run_dispatch(false).await.unwrap();
    assert_eq!(report.started_count, 1);
    assert!(pool.drain(Duration::from_secs(5)).await);
    assert_eq!(harness.status(first), TaskStatus::ReadyForReview);
    assert_eq!(harness.status(second), TaskStatus::ReadyForReview);
}

#[tokio::test]
async fn test_retried_step_reruns_through_dispatch() {
    let harness = TestHarness::new();
    let task_id = harness.queued_task(ModerationMode::Auto);

    let (dispatcher, pool) = harness.dispatcher(registry(Some("T04_CROP_RESIZE")), (2, 1));
    dispatcher.run_dispatch(false).await.unwrap();
    assert!(pool.drain(Duration::from_secs(5)).await);
    assert_eq!(harness.status(task_id), TaskStatus::Error);

    let control = TaskControl::new(harness.tasks.clone());
    let outcome = control
        .retry_step(task_id, 1, Some(json!({ "width": 720, "height": 1280 })))
        .await
        .unwrap();
    assert_eq!(outcome.status, TaskStatus::Queued);
    assert_eq!(outcome.new_version, 2);

    let (dispatcher, pool) = harness.dispatcher(registry(None), (2, 1));
    let report = dispatcher.run_dispatch(false).await.unwrap();
    assert_eq!(report.started_count, 1);
    assert!(pool.drain(Duration::from_secs(5)).await);

    let task = harness.tasks.get(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::ReadyForPublish);
    assert!(task.retry_from.is_none());
    assert!(task.error_message.is_none());

    let crop: Vec<_> = harness
        .tasks
        .step_results(task_id)
        .unwrap()
        .into_iter()
        .filter(|r| r.step_index == 1)
        .collect();
    assert_eq!(crop.len(), 2);
    assert_eq!(crop[1].status, StepResultStatus::Completed);
    assert_eq!(crop[1].input_params["width"], 720);
}
