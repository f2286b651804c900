//! Bounded pool that runs leased tasks off the control loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::runner::TaskProcessor;
use crate::metrics;

/// Snapshot of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub max_parallel: usize,
    pub active: usize,
    pub total_processed: u64,
    pub total_failed: u64,
}

#[derive(Default)]
struct PoolStats {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Runs [`TaskProcessor::process`] for dispatched tasks, at most
/// `max_parallel` at a time.
///
/// `submit` never waits: the dispatcher has already committed the
/// reservation, and jobs queue on the semaphore.
pub struct WorkerPool {
    processor: Arc<TaskProcessor>,
    semaphore: Arc<Semaphore>,
    max_parallel: usize,
    stats: Arc<PoolStats>,
    jobs: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(processor: Arc<TaskProcessor>, max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            processor,
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
            stats: Arc::new(PoolStats::default()),
            jobs: Mutex::new(JoinSet::new()),
        }
    }

    /// Queue a leased task for processing.
    pub fn submit(&self, task_id: i64, lease_id: String) {
        let processor = self.processor.clone();
        let semaphore = self.semaphore.clone();
        let stats = self.stats.clone();

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished jobs so the set does not grow without bound.
        while jobs.try_join_next().is_some() {}
        jobs.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                warn!(task_id, "Worker pool closed, task left to the watchdog");
                return;
            };
            metrics::WORKER_POOL_ACTIVE.inc();
            debug!(task_id, "Worker picked up task");
            match processor.process(task_id, &lease_id).await {
                Ok(outcome) => {
                    stats.processed.fetch_add(1, Ordering::Relaxed);
                    debug!(task_id, status = %outcome.status, "Worker finished task");
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(task_id, error = %e, "Task processing failed");
                }
            }
            metrics::WORKER_POOL_ACTIVE.dec();
        });
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            max_parallel: self.max_parallel,
            active: self.max_parallel - self.semaphore.available_permits(),
            total_processed: self.stats.processed.load(Ordering::Relaxed),
            total_failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Wait for every submitted job, up to `timeout`. Returns false when
    /// jobs were still running at the deadline; those are aborted.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut jobs = {
            let mut guard = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let finished = tokio::time::timeout(timeout, async {
            while jobs.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !finished {
            warn!(remaining = jobs.len(), "Worker pool drain timed out, aborting jobs");
            jobs.abort_all();
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogStore, Project, SqliteCatalog};
    use crate::executor::{HandlerRegistry, PipelineExecutor, StepKind};
    use crate::processor::ProcessorConfig;
    use crate::task::{Lease, SqliteTaskStore, TaskStatus, TaskStore, TaskUpdate};
    use crate::testing::{fixtures, MockStepHandler};
    use serde_json::json;

    #[tokio::test]
    async fn test_pool_processes_submitted_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let catalog = Arc::new(SqliteCatalog::in_memory().unwrap());
        let project = catalog.create_project(Project::new("p")).unwrap();

        let metadata = MockStepHandler::ok(json!({})).with_delay(Duration::from_millis(20));
        let calls = metadata.calls();
        let mut registry = HandlerRegistry::new();
        registry.register(StepKind::Probe, Arc::new(metadata));
        let executor = PipelineExecutor::new(Arc::new(registry), Duration::from_secs(5));
        let processor = Arc::new(TaskProcessor::new(
            tasks.clone(),
            catalog,
            Arc::new(executor),
            ProcessorConfig::default().with_work_dir(dir.path()),
        ));
        let pool = WorkerPool::new(processor, 1);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = tasks
                .create(fixtures::create_request(project.id, 1))
                .unwrap();
            let lease = Lease::new(chrono::Duration::minutes(5));
            tasks
                .transition(
                    task.id,
                    TaskStatus::Processing,
                    TaskUpdate::new().lease(Some(lease.clone())),
                )
                .unwrap();
            pool.submit(task.id, lease.id);
            ids.push(task.id);
        }

        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        for id in ids {
            assert_eq!(
                tasks.get(id).unwrap().unwrap().status,
                TaskStatus::ReadyForReview
            );
        }
        let status = pool.status();
        assert_eq!(status.total_processed, 3);
        assert_eq!(status.active, 0);
    }
}
