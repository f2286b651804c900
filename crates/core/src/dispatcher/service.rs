//! One dispatch pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{
    ConcurrencySnapshot, DispatchError, DispatchReport, DispatcherConfig, SkippedTask, StartedTask,
};
use crate::audit::{AuditEvent, AuditHandle};
use crate::catalog::CatalogStore;
use crate::metrics;
use crate::processor::WorkerPool;
use crate::task::{
    Lease, PublishTask, TaskFilter, TaskOrder, TaskStatus, TaskStore, TaskUpdate,
};

/// Upper bound when listing running tasks; far above any sane limit.
const RUNNING_SCAN_LIMIT: i64 = 10_000;

/// Admits queued tasks into processing.
pub struct Dispatcher {
    tasks: Arc<dyn TaskStore>,
    catalog: Arc<dyn CatalogStore>,
    config: DispatcherConfig,
    pool: Option<Arc<WorkerPool>>,
    audit: Option<AuditHandle>,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        catalog: Arc<dyn CatalogStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            tasks,
            catalog,
            config,
            pool: None,
            audit: None,
        }
    }

    /// Hand admitted tasks to `pool`. Without a pool admissions are only
    /// committed.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Tasks in `processing` or `publishing`.
    fn running_tasks(&self) -> Result<Vec<PublishTask>, DispatchError> {
        let mut running = Vec::new();
        for status in [TaskStatus::Processing, TaskStatus::Publishing] {
            let filter = TaskFilter::new()
                .with_status(status)
                .with_limit(RUNNING_SCAN_LIMIT);
            running.extend(self.tasks.list(&filter)?);
        }
        Ok(running)
    }

    /// Queued tasks, best candidate score first, oldest first on ties.
    fn ranked_queue(&self) -> Result<Vec<(PublishTask, f64)>, DispatchError> {
        let filter = TaskFilter::new()
            .with_status(TaskStatus::Queued)
            .with_order(TaskOrder::CreatedAsc)
            .with_limit(self.config.scan_limit);
        let queued = self.tasks.list(&filter)?;
        let ids: Vec<i64> = queued.iter().map(|t| t.id).collect();
        let candidates = self.catalog.candidates_for_tasks(&ids)?;

        let mut ranked: Vec<(PublishTask, f64)> = queued
            .into_iter()
            .map(|task| {
                let score = candidates
                    .get(&task.id)
                    .map(|c| c.base_score())
                    .unwrap_or(0.0);
                (task, score)
            })
            .collect();
        ranked.sort_by(|(a, sa), (b, sb)| {
            sb.total_cmp(sa)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(ranked)
    }

    /// Admit as many queued tasks as the limits allow.
    ///
    /// A dry run reports the same decisions without reserving anything.
    pub async fn run_dispatch(&self, dry_run: bool) -> Result<DispatchReport, DispatchError> {
        let run_at = Utc::now();
        let max_global = self.config.max_parallel;
        let max_per_dest = self.config.max_parallel_per_destination;

        let running = self.running_tasks()?;
        let running_before = running.len();
        let mut per_dest: BTreeMap<i64, usize> = BTreeMap::new();
        for task in &running {
            *per_dest.entry(task.destination_id).or_default() += 1;
        }

        let mut started = Vec::new();
        let mut skipped = Vec::new();
        let mut used = 0usize;

        for (task, score) in self.ranked_queue()? {
            if running_before + used >= max_global {
                skipped.push(SkippedTask {
                    task_id: task.id,
                    reason: format!("global_limit: {}/{}", running_before + used, max_global),
                });
                continue;
            }
            let dest_running = per_dest.get(&task.destination_id).copied().unwrap_or(0);
            if dest_running >= max_per_dest {
                skipped.push(SkippedTask {
                    task_id: task.id,
                    reason: format!(
                        "per_dest_limit: dest={} has {}/{}",
                        task.destination_id, dest_running, max_per_dest
                    ),
                });
                continue;
            }

            let lease_id = if dry_run {
                None
            } else {
                let lease = Lease::new(chrono::Duration::minutes(self.config.lease_ttl_minutes));
                let update = TaskUpdate::new()
                    .lease(Some(lease.clone()))
                    .processing_started_at(Utc::now())
                    .pipeline_status("dispatched")
                    .error_message(None);
                if let Err(e) = self.tasks.transition(task.id, TaskStatus::Processing, update) {
                    warn!(task_id = task.id, error = %e, "Failed to reserve task");
                    skipped.push(SkippedTask {
                        task_id: task.id,
                        reason: format!("reserve_failed: {}", e),
                    });
                    continue;
                }
                metrics::TASKS_DISPATCHED_TOTAL.inc();
                if let Some(ref pool) = self.pool {
                    pool.submit(task.id, lease.id.clone());
                }
                Some(lease.id)
            };

            debug!(task_id = task.id, score, dry_run, "Task admitted");
            used += 1;
            *per_dest.entry(task.destination_id).or_default() += 1;
            started.push(StartedTask {
                task_id: task.id,
                destination_id: task.destination_id,
                score,
                lease_id,
            });
        }

        let report = DispatchReport {
            started_count: started.len(),
            skipped_count: skipped.len(),
            concurrency: ConcurrencySnapshot {
                global_running_before: running_before,
                global_running_after: running_before + used,
                max_parallel: max_global,
                max_per_destination: max_per_dest,
                per_dest_running: per_dest,
            },
            started,
            skipped,
            dry_run,
            run_at,
        };

        if report.started_count > 0 {
            info!(
                started = report.started_count,
                skipped = report.skipped_count,
                dry_run,
                "Dispatch pass"
            );
        }
        if !dry_run && report.started_count > 0 {
            if let Some(ref audit) = self.audit {
                audit
                    .emit(AuditEvent::AutoProcess {
                        started_count: report.started_count,
                        skipped_count: report.skipped_count,
                        task_ids: report.started.iter().map(|s| s.task_id).collect(),
                    })
                    .await;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Project, SqliteCatalog};
    use crate::task::{CreateTaskRequest, SqliteTaskStore};
    use crate::testing::fixtures;

    struct Harness {
        tasks: Arc<SqliteTaskStore>,
        catalog: Arc<SqliteCatalog>,
        project_id: i64,
    }

    fn harness() -> Harness {
        let tasks = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let catalog = Arc::new(SqliteCatalog::in_memory().unwrap());
        let project = catalog.create_project(Project::new("p")).unwrap();
        Harness {
            tasks,
            catalog,
            project_id: project.id,
        }
    }

    fn dispatcher(h: &Harness, global: usize, per_dest: usize) -> Dispatcher {
        Dispatcher::new(
            h.tasks.clone(),
            h.catalog.clone(),
            DispatcherConfig::default().with_limits(global, per_dest),
        )
    }

    fn queued(h: &Harness, destination_id: i64, score: Option<f64>) -> PublishTask {
        let candidate_id = score.map(|s| {
            h.catalog
                .create_candidate(fixtures::candidate(h.project_id, s, "author", &[]))
                .unwrap()
                .id
        });
        h.tasks
            .create(CreateTaskRequest {
                candidate_id,
                ..fixtures::create_request(h.project_id, destination_id)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_global_limit_is_respected() {
        let h = harness();
        let ids: Vec<i64> = (1..=4).map(|d| queued(&h, d, None).id).collect();

        let report = dispatcher(&h, 2, 1).run_dispatch(false).await.unwrap();
        assert_eq!(report.started_count, 2);
        assert_eq!(report.skipped_count, 2);
        assert_eq!(report.skipped[0].reason, "global_limit: 2/2");
        assert_eq!(report.concurrency.global_running_before, 0);
        assert_eq!(report.concurrency.global_running_after, 2);

        let processing = h
            .tasks
            .count(&TaskFilter::new().with_status(TaskStatus::Processing))
            .unwrap();
        assert_eq!(processing, 2);
        let first = h.tasks.get(ids[0]).unwrap().unwrap();
        assert!(first.lease.is_some());
        assert!(first.processing_started_at.is_some());

        // A second pass admits nothing while the slots are held.
        let report = dispatcher(&h, 2, 1).run_dispatch(false).await.unwrap();
        assert_eq!(report.started_count, 0);
        assert_eq!(report.concurrency.global_running_before, 2);
    }

    #[tokio::test]
    async fn test_per_destination_limit() {
        let h = harness();
        queued(&h, 7, None);
        queued(&h, 7, None);
        queued(&h, 8, None);

        let report = dispatcher(&h, 10, 1).run_dispatch(false).await.unwrap();
        assert_eq!(report.started_count, 2);
        assert_eq!(report.skipped[0].reason, "per_dest_limit: dest=7 has 1/1");
        assert_eq!(report.concurrency.per_dest_running[&7], 1);
        assert_eq!(report.concurrency.per_dest_running[&8], 1);
    }

    #[tokio::test]
    async fn test_higher_score_goes_first() {
        let h = harness();
        let low = queued(&h, 1, Some(0.4));
        let high = queued(&h, 2, Some(0.9));
        let none = queued(&h, 3, None);

        let report = dispatcher(&h, 1, 1).run_dispatch(false).await.unwrap();
        assert_eq!(report.started[0].task_id, high.id);
        let skipped: Vec<i64> = report.skipped.iter().map(|s| s.task_id).collect();
        assert_eq!(skipped, vec![low.id, none.id]);
    }

    #[tokio::test]
    async fn test_global_limit_admits_best_scores() {
        let h = harness();
        let best = queued(&h, 1, Some(0.9));
        let worst = queued(&h, 2, Some(0.5));
        let middle = queued(&h, 3, Some(0.7));

        let report = dispatcher(&h, 2, 1).run_dispatch(false).await.unwrap();
        let started: Vec<i64> = report.started.iter().map(|s| s.task_id).collect();
        assert_eq!(started, vec![best.id, middle.id]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].task_id, worst.id);
        assert_eq!(report.skipped[0].reason, "global_limit: 2/2");

        assert_eq!(
            h.tasks.get(worst.id).unwrap().unwrap().status,
            TaskStatus::Queued
        );
        assert_eq!(
            h.tasks.get(middle.id).unwrap().unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_dry_run_reserves_nothing() {
        let h = harness();
        let task = queued(&h, 1, None);

        let report = dispatcher(&h, 2, 1).run_dispatch(true).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.started_count, 1);
        assert!(report.started[0].lease_id.is_none());
        assert_eq!(
            h.tasks.get(task.id).unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_publishing_tasks_count_as_running() {
        let h = harness();
        let busy = queued(&h, 1, None);
        h.tasks
            .transition(busy.id, TaskStatus::Processing, TaskUpdate::new())
            .unwrap();
        h.tasks
            .transition(busy.id, TaskStatus::ReadyForPublish, TaskUpdate::new())
            .unwrap();
        h.tasks
            .transition(busy.id, TaskStatus::Publishing, TaskUpdate::new())
            .unwrap();
        queued(&h, 2, None);

        let report = dispatcher(&h, 1, 1).run_dispatch(false).await.unwrap();
        assert_eq!(report.started_count, 0);
        assert_eq!(report.skipped[0].reason, "global_limit: 1/1");
    }
}
