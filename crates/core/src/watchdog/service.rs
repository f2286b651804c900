use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, warn};

use super::{
    RecentDecision, StuckCounts, StuckItem, WatchdogConfig, WatchdogError, WatchdogHealth,
    WatchdogReport, WatchdogSettings, WATCHDOG_TOOL_ID,
};
use crate::audit::{AuditEvent, AuditFilter, AuditHandle, AuditStore};
use crate::metrics;
use crate::task::{
    NewStepResult, PublishTask, StepResultStatus, TaskFilter, TaskStatus, TaskStore, TaskUpdate,
    WATCHDOG_STEP_INDEX,
};

const RUNNING_SCAN_LIMIT: i64 = 10_000;
const RECENT_DECISIONS: i64 = 10;

/// Finds and reclaims stuck tasks.
pub struct Watchdog {
    tasks: Arc<dyn TaskStore>,
    config: WatchdogConfig,
    audit: Option<AuditHandle>,
    audit_store: Option<Arc<dyn AuditStore>>,
}

impl Watchdog {
    pub fn new(tasks: Arc<dyn TaskStore>, config: WatchdogConfig) -> Self {
        Self {
            tasks,
            config,
            audit: None,
            audit_store: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Store read by [`health`](Self::health) for recent decisions.
    pub fn with_audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    fn settings(&self) -> WatchdogSettings {
        WatchdogSettings {
            stuck_processing_minutes: self.config.stuck_processing_minutes,
            stuck_publishing_minutes: self.config.stuck_publishing_minutes,
            auto_requeue: self.config.auto_requeue,
        }
    }

    fn threshold(&self, status: TaskStatus) -> i64 {
        match status {
            TaskStatus::Publishing => self.config.stuck_publishing_minutes,
            _ => self.config.stuck_processing_minutes,
        }
    }

    /// Tasks in `status` running longer than its threshold, with their age
    /// in minutes.
    fn stuck(
        &self,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Vec<(PublishTask, f64)>, WatchdogError> {
        let threshold = self.threshold(status) as f64;
        let filter = TaskFilter::new()
            .with_status(status)
            .with_limit(RUNNING_SCAN_LIMIT);
        Ok(self
            .tasks
            .list(&filter)?
            .into_iter()
            .filter_map(|task| {
                let age = (now - task.running_since()).num_seconds() as f64 / 60.0;
                (age > threshold).then_some((task, age))
            })
            .collect())
    }

    pub async fn run_watchdog(&self, dry_run: bool) -> Result<WatchdogReport, WatchdogError> {
        self.run_watchdog_at(Utc::now(), dry_run).await
    }

    /// One pass as if the current time were `now`.
    pub async fn run_watchdog_at(
        &self,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<WatchdogReport, WatchdogError> {
        let processing = self.stuck(TaskStatus::Processing, now)?;
        let publishing = self.stuck(TaskStatus::Publishing, now)?;
        let stuck_processing = processing.len();
        let stuck_publishing = publishing.len();

        let mut items = Vec::new();
        for (task, age) in processing.into_iter().chain(publishing) {
            let threshold = self.threshold(task.status);
            let message = format!(
                "watchdog: stuck {} > {}m (age={:.0}m)",
                task.status, threshold, age
            );
            let mut item = StuckItem {
                task_id: task.id,
                project_id: task.project_id,
                status: task.status,
                age_minutes: age.round() as i64,
                threshold_minutes: threshold,
                action: "would_mark_error".to_string(),
                error_message: message,
            };

            if !dry_run {
                match self.reclaim(&task, &item, now) {
                    Ok(()) => {
                        item.action = "marked_error".to_string();
                        metrics::WATCHDOG_RECLAIMED_TOTAL
                            .with_label_values(&[task.status.as_str()])
                            .inc();
                        warn!(
                            task_id = task.id,
                            status = %task.status,
                            age_minutes = item.age_minutes,
                            "Reclaimed stuck task"
                        );
                        self.audit_reclaim(&item).await;
                    }
                    Err(e) => {
                        error!(task_id = task.id, error = %e, "Failed to reclaim stuck task");
                        item.action = "failed".to_string();
                    }
                }
            }
            items.push(item);
        }

        if !items.is_empty() {
            info!(stuck = items.len(), dry_run, "Watchdog pass");
        }
        Ok(WatchdogReport {
            stuck_count: items.len(),
            stuck_processing,
            stuck_publishing,
            items,
            dry_run,
            run_at: now,
            settings: self.settings(),
        })
    }

    /// Record the watchdog step, then force the task into `error`.
    fn reclaim(
        &self,
        task: &PublishTask,
        item: &StuckItem,
        now: DateTime<Utc>,
    ) -> Result<(), WatchdogError> {
        let previous = self
            .tasks
            .step_results(task.id)?
            .into_iter()
            .filter(|r| r.step_index == WATCHDOG_STEP_INDEX)
            .max_by_key(|r| r.version);
        let mut step = match previous {
            Some(ref prev) => NewStepResult::retry_of(prev, StepResultStatus::Error),
            None => NewStepResult::new(
                task.id,
                WATCHDOG_STEP_INDEX,
                WATCHDOG_TOOL_ID,
                format!("Watchdog: stuck {}", task.status),
                StepResultStatus::Error,
            ),
        };
        step.output_data = json!({
            "old_status": task.status,
            "age_minutes": item.age_minutes,
            "threshold_minutes": item.threshold_minutes,
        });
        step.error_message = Some(item.error_message.clone());
        step.started_at = Some(now);
        step.completed_at = Some(now);
        self.tasks.insert_step_result(step)?;

        let mut update = TaskUpdate::new()
            .error_message(Some(item.error_message.clone()))
            .pipeline_status("watchdog")
            .lease(None);
        if task.status == TaskStatus::Publishing {
            update = update.publish_error(Some(item.error_message.clone()));
        }
        self.tasks.transition(task.id, TaskStatus::Error, update)?;
        Ok(())
    }

    async fn audit_reclaim(&self, item: &StuckItem) {
        if let Some(ref audit) = self.audit {
            audit
                .emit(AuditEvent::WatchdogStuck {
                    project_id: item.project_id,
                    task_id: item.task_id,
                    old_status: item.status.as_str().to_string(),
                    age_minutes: item.age_minutes,
                    new_status: TaskStatus::Error.as_str().to_string(),
                })
                .await;
        }
    }

    /// Counts by status, current stuck counts and the latest decisions.
    pub fn health(&self) -> Result<WatchdogHealth, WatchdogError> {
        let now = Utc::now();
        let by_status = self.tasks.count_by_status()?;
        let counts: BTreeMap<String, i64> = TaskStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), by_status.get(s).copied().unwrap_or(0)))
            .collect();

        let last_decisions = match self.audit_store {
            Some(ref store) => store
                .query(&AuditFilter::new().with_limit(RECENT_DECISIONS))?
                .into_iter()
                .map(|record| RecentDecision {
                    action: record.event_type,
                    project_id: record.project_id,
                    task_id: record.task_id,
                    at: record.timestamp,
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(WatchdogHealth {
            counts,
            stuck: StuckCounts {
                processing: self.stuck(TaskStatus::Processing, now)?.len(),
                publishing: self.stuck(TaskStatus::Publishing, now)?.len(),
            },
            last_decisions,
            settings: self.settings(),
            checked_at: now,
        })
    }
}
