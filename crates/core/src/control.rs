//! Operator task control: pause, cancel, resume and requeue.
//!
//! A `queued` task is paused or canceled immediately. A `processing` task
//! only gets a request flag; the executor checks it between steps and the
//! processor records the interruption (see [`record_interruption`]).

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::audit::{AuditEvent, AuditHandle};
use crate::task::{
    ControlFlags, NewStepResult, PublishTask, StepCompletion, StepResultStatus, StepRetry,
    TaskError, TaskStatus, TaskStore, TaskUpdate, CONTROL_STEP_INDEX,
};

/// A pending operator request observed by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlSignal {
    Pause { reason: Option<String> },
    Cancel { reason: Option<String> },
}

impl ControlSignal {
    /// The request carried by `flags`. Cancel wins over pause.
    pub fn from_flags(flags: &ControlFlags) -> Option<Self> {
        if flags.cancel_requested_at.is_some() {
            Some(ControlSignal::Cancel {
                reason: flags.cancel_reason.clone(),
            })
        } else if flags.pause_requested_at.is_some() {
            Some(ControlSignal::Pause {
                reason: flags.pause_reason.clone(),
            })
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Pause { .. } => "pause",
            ControlSignal::Cancel { .. } => "cancel",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ControlSignal::Pause { reason } | ControlSignal::Cancel { reason } => reason.as_deref(),
        }
    }

    fn target_status(&self) -> TaskStatus {
        match self {
            ControlSignal::Pause { .. } => TaskStatus::Paused,
            ControlSignal::Cancel { .. } => TaskStatus::Canceled,
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("task not found: {0}")]
    NotFound(i64),

    #[error("cannot {action} task {task_id} in state {status}")]
    InvalidState {
        task_id: i64,
        action: &'static str,
        status: TaskStatus,
    },

    #[error("task {task_id} has no result for step {step_index}")]
    StepNotFound { task_id: i64, step_index: i64 },

    #[error("step {step_index} of task {task_id} cannot be retried")]
    StepNotRetryable { task_id: i64, step_index: i64 },

    #[error("task store error: {0}")]
    Task(#[from] TaskError),
}

/// Result of a control request.
#[derive(Debug, Clone, Serialize)]
pub struct ControlOutcome {
    pub task_id: i64,
    pub action: &'static str,
    pub status: TaskStatus,
    /// True when only a request flag was set and the running pipeline will
    /// act on it between steps.
    pub pending: bool,
}

/// Result of a step retry request.
#[derive(Debug, Clone, Serialize)]
pub struct StepRetryOutcome {
    pub task_id: i64,
    pub step_index: i64,
    /// Version of the `pending` step result the next run fills in.
    pub new_version: i64,
    pub status: TaskStatus,
}

/// Applies operator requests to tasks.
pub struct TaskControl {
    tasks: Arc<dyn TaskStore>,
    audit: Option<AuditHandle>,
}

impl TaskControl {
    pub fn new(tasks: Arc<dyn TaskStore>) -> Self {
        Self { tasks, audit: None }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    fn load(&self, task_id: i64) -> Result<PublishTask, ControlError> {
        self.tasks
            .get(task_id)?
            .ok_or(ControlError::NotFound(task_id))
    }

    async fn record(&self, task: &PublishTask, action: &str, reason: Option<&str>) {
        tracing::info!(task_id = task.id, action, reason = ?reason, "Task control");
        if let Some(ref audit) = self.audit {
            audit
                .emit(AuditEvent::TaskControl {
                    project_id: task.project_id,
                    task_id: task.id,
                    action: action.to_string(),
                    reason: reason.map(String::from),
                })
                .await;
        }
    }

    pub async fn pause(
        &self,
        task_id: i64,
        reason: Option<String>,
    ) -> Result<ControlOutcome, ControlError> {
        self.interrupt(task_id, ControlSignal::Pause { reason }).await
    }

    pub async fn cancel(
        &self,
        task_id: i64,
        reason: Option<String>,
    ) -> Result<ControlOutcome, ControlError> {
        self.interrupt(task_id, ControlSignal::Cancel { reason }).await
    }

    async fn interrupt(
        &self,
        task_id: i64,
        signal: ControlSignal,
    ) -> Result<ControlOutcome, ControlError> {
        let task = self.load(task_id)?;
        let action = signal.as_str();

        let (updated, pending) = match task.status {
            TaskStatus::Queued => {
                let update = terminal_update(&signal).control(ControlFlags::default());
                let updated = self
                    .tasks
                    .transition(task_id, signal.target_status(), update)?;
                (updated, false)
            }
            TaskStatus::Processing => {
                let now = Utc::now();
                let mut flags = task.control.clone();
                match &signal {
                    ControlSignal::Pause { reason } => {
                        flags.pause_requested_at = Some(now);
                        flags.pause_reason = reason.clone();
                    }
                    ControlSignal::Cancel { reason } => {
                        flags.cancel_requested_at = Some(now);
                        flags.cancel_reason = reason.clone();
                    }
                }
                let updated = self.tasks.update(task_id, TaskUpdate::new().control(flags))?;
                (updated, true)
            }
            status => {
                return Err(ControlError::InvalidState {
                    task_id,
                    action,
                    status,
                })
            }
        };

        self.record(&updated, action, signal.reason()).await;
        Ok(ControlOutcome {
            task_id,
            action,
            status: updated.status,
            pending,
        })
    }

    /// `paused -> queued`, clearing control flags.
    pub async fn resume(&self, task_id: i64) -> Result<ControlOutcome, ControlError> {
        let task = self.load(task_id)?;
        if task.status != TaskStatus::Paused {
            return Err(ControlError::InvalidState {
                task_id,
                action: "resume",
                status: task.status,
            });
        }

        let updated = self.tasks.transition(
            task_id,
            TaskStatus::Queued,
            TaskUpdate::new()
                .control(ControlFlags::default())
                .lease(None),
        )?;
        self.record(&updated, "resume", None).await;
        Ok(ControlOutcome {
            task_id,
            action: "resume",
            status: updated.status,
            pending: false,
        })
    }

    /// `error -> queued`, clearing error fields.
    pub async fn requeue(&self, task_id: i64) -> Result<ControlOutcome, ControlError> {
        let task = self.load(task_id)?;
        if task.status != TaskStatus::Error {
            return Err(ControlError::InvalidState {
                task_id,
                action: "requeue",
                status: task.status,
            });
        }

        let updated = self.tasks.transition(
            task_id,
            TaskStatus::Queued,
            TaskUpdate::new()
                .error_message(None)
                .publish_error(None)
                .control(ControlFlags::default())
                .lease(None),
        )?;
        self.record(&updated, "requeue", None).await;
        Ok(ControlOutcome {
            task_id,
            action: "requeue",
            status: updated.status,
            pending: false,
        })
    }

    /// Rerun the pipeline of a task from `step_index`, optionally with new
    /// parameters for that step.
    ///
    /// Adds a `pending` version to the step's result chain and queues the
    /// task with a resume point. Allowed from `error`, `paused` and
    /// `ready_for_review`.
    pub async fn retry_step(
        &self,
        task_id: i64,
        step_index: i64,
        params: Option<Value>,
    ) -> Result<StepRetryOutcome, ControlError> {
        let task = self.load(task_id)?;
        if !matches!(
            task.status,
            TaskStatus::Error | TaskStatus::Paused | TaskStatus::ReadyForReview
        ) {
            return Err(ControlError::InvalidState {
                task_id,
                action: "retry_step",
                status: task.status,
            });
        }

        let latest = self
            .tasks
            .step_results(task_id)?
            .into_iter()
            .filter(|r| r.step_index == step_index)
            .max_by_key(|r| r.version)
            .ok_or(ControlError::StepNotFound {
                task_id,
                step_index,
            })?;
        if !latest.can_retry {
            return Err(ControlError::StepNotRetryable {
                task_id,
                step_index,
            });
        }
        if latest.status == StepResultStatus::Pending {
            self.tasks.complete_step_result(
                latest.id,
                StepCompletion {
                    status: StepResultStatus::Skipped,
                    output_data: json!({}),
                    error_message: Some("Superseded by a newer retry".to_string()),
                    started_at: None,
                    completed_at: Some(Utc::now()),
                },
            )?;
        }

        let mut next = NewStepResult::retry_of(&latest, StepResultStatus::Pending);
        next.can_retry = true;
        if let Some(ref params) = params {
            next.input_params = params.clone();
        }
        let pending = self.tasks.insert_step_result(next)?;

        let mut update = TaskUpdate::new()
            .retry_from(Some(StepRetry {
                step_index,
                params,
                result_id: pending.id,
            }))
            .pipeline_status("pending_retry")
            .error_message(None)
            .publish_error(None)
            .control(ControlFlags::default())
            .lease(None);
        update.current_step_index = Some(step_index);
        let updated = self.tasks.transition(task_id, TaskStatus::Queued, update)?;

        let reason = format!("step {} ({}) v{}", step_index, pending.tool_id, pending.version);
        self.record(&updated, "retry_step", Some(&reason)).await;
        Ok(StepRetryOutcome {
            task_id,
            step_index,
            new_version: pending.version,
            status: updated.status,
        })
    }
}

/// Fields written when a task lands in `paused` or `canceled`.
fn terminal_update(signal: &ControlSignal) -> TaskUpdate {
    let now = Utc::now();
    match signal {
        ControlSignal::Pause { .. } => TaskUpdate::new().paused_at(now).lease(None),
        ControlSignal::Cancel { reason } => TaskUpdate::new()
            .canceled_at(now)
            .lease(None)
            .error_message(Some(format!(
                "Canceled by user: {}",
                reason.as_deref().unwrap_or("no reason")
            ))),
    }
}

/// Record that a running pipeline stopped on an operator request: a
/// `CONTROL` step result at the reserved index and the matching transition.
pub fn record_interruption(
    tasks: &dyn TaskStore,
    task_id: i64,
    signal: &ControlSignal,
    mut update: TaskUpdate,
) -> Result<PublishTask, TaskError> {
    if update.held_by.is_some() {
        let task = tasks.get(task_id)?.ok_or(TaskError::NotFound(task_id))?;
        if !update.lease_matches(&task) {
            return Err(TaskError::LeaseLost {
                task_id,
                lease_id: update.held_by.unwrap_or_default(),
            });
        }
    }

    let status = match signal {
        ControlSignal::Pause { .. } => StepResultStatus::Paused,
        ControlSignal::Cancel { .. } => StepResultStatus::Canceled,
    };

    let previous = tasks
        .step_results(task_id)?
        .into_iter()
        .filter(|r| r.step_index == CONTROL_STEP_INDEX)
        .max_by_key(|r| r.version);
    let mut result = match previous {
        Some(ref prev) => NewStepResult::retry_of(prev, status),
        None => NewStepResult::new(task_id, CONTROL_STEP_INDEX, "CONTROL", "Task control", status),
    };
    let now = Utc::now();
    result.output_data = json!({ "action": signal.as_str(), "reason": signal.reason() });
    result.error_message = signal.reason().map(String::from);
    result.started_at = Some(now);
    result.completed_at = Some(now);
    tasks.insert_step_result(result)?;

    let terminal = terminal_update(signal);
    update.paused_at = terminal.paused_at;
    update.canceled_at = terminal.canceled_at;
    if terminal.error_message.is_some() {
        update.error_message = terminal.error_message;
    }
    update.lease = Some(None);
    update.control = Some(ControlFlags::default());
    update.pipeline_status = Some(signal.target_status().as_str().to_string());

    tasks.transition(task_id, signal.target_status(), update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SqliteTaskStore;
    use crate::testing::fixtures;

    fn setup() -> (Arc<SqliteTaskStore>, TaskControl) {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let control = TaskControl::new(store.clone());
        (store, control)
    }

    #[test]
    fn test_cancel_takes_priority_over_pause() {
        let now = Utc::now();
        let flags = ControlFlags {
            pause_requested_at: Some(now),
            pause_reason: Some("later".to_string()),
            cancel_requested_at: Some(now),
            cancel_reason: Some("wrong".to_string()),
        };
        assert_eq!(
            ControlSignal::from_flags(&flags),
            Some(ControlSignal::Cancel {
                reason: Some("wrong".to_string())
            })
        );
        assert_eq!(ControlSignal::from_flags(&ControlFlags::default()), None);
    }

    #[tokio::test]
    async fn test_cancel_queued_task_is_immediate() {
        let (store, control) = setup();
        let task = store.create(fixtures::create_request(1, 1)).unwrap();

        let outcome = control.cancel(task.id, None).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Canceled);
        assert!(!outcome.pending);

        let task = store.get(task.id).unwrap().unwrap();
        assert!(task.canceled_at.is_some());
        assert_eq!(task.error_message.as_deref(), Some("Canceled by user: no reason"));
    }

    #[tokio::test]
    async fn test_pause_processing_task_sets_request() {
        let (store, control) = setup();
        let task = store.create(fixtures::create_request(1, 1)).unwrap();
        store
            .transition(task.id, TaskStatus::Processing, TaskUpdate::new())
            .unwrap();

        let outcome = control
            .pause(task.id, Some("check audio".to_string()))
            .await
            .unwrap();
        assert!(outcome.pending);
        assert_eq!(outcome.status, TaskStatus::Processing);

        let task = store.get(task.id).unwrap().unwrap();
        assert!(task.control.pause_requested_at.is_some());
        assert_eq!(task.control.pause_reason.as_deref(), Some("check audio"));
    }

    #[tokio::test]
    async fn test_resume_and_requeue_require_matching_state() {
        let (store, control) = setup();
        let task = store.create(fixtures::create_request(1, 1)).unwrap();

        assert!(matches!(
            control.resume(task.id).await,
            Err(ControlError::InvalidState { action: "resume", .. })
        ));

        control.pause(task.id, None).await.unwrap();
        let outcome = control.resume(task.id).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Queued);

        assert!(matches!(
            control.requeue(task.id).await,
            Err(ControlError::InvalidState { action: "requeue", .. })
        ));
        assert!(matches!(
            control.pause(999, None).await,
            Err(ControlError::NotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_requeue_clears_errors() {
        let (store, control) = setup();
        let task = store.create(fixtures::create_request(1, 1)).unwrap();
        store
            .transition(task.id, TaskStatus::Processing, TaskUpdate::new())
            .unwrap();
        store
            .transition(
                task.id,
                TaskStatus::Error,
                TaskUpdate::new().error_message(Some("boom".to_string())),
            )
            .unwrap();

        control.requeue(task.id).await.unwrap();
        let task = store.get(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.error_message, None);
    }

    /// A task that failed at `step_index` with a retryable result.
    fn failed_at(store: &SqliteTaskStore, step_index: i64) -> (PublishTask, crate::task::StepResult) {
        let task = store.create(fixtures::create_request(1, 1)).unwrap();
        store
            .transition(task.id, TaskStatus::Processing, TaskUpdate::new())
            .unwrap();
        let mut result = NewStepResult::new(
            task.id,
            step_index,
            "T04_CROP_RESIZE",
            "Crop",
            StepResultStatus::Error,
        );
        result.can_retry = true;
        result.input_params = json!({ "width": 1080, "height": 1920 });
        let result = store.insert_step_result(result).unwrap();
        let task = store
            .transition(
                task.id,
                TaskStatus::Error,
                TaskUpdate::new().error_message(Some("scale failed".to_string())),
            )
            .unwrap();
        (task, result)
    }

    #[tokio::test]
    async fn test_retry_step_versions_result_and_queues_task() {
        let (store, control) = setup();
        let (task, failed) = failed_at(&store, 1);

        let outcome = control
            .retry_step(task.id, 1, Some(json!({ "width": 720, "height": 1280 })))
            .await
            .unwrap();
        assert_eq!(outcome.status, TaskStatus::Queued);
        assert_eq!(outcome.new_version, 2);

        let results = store.step_results(task.id).unwrap();
        assert_eq!(results.len(), 2);
        let pending = &results[1];
        assert_eq!(pending.status, StepResultStatus::Pending);
        assert_eq!(pending.previous_version_id, Some(failed.id));
        assert_eq!(pending.retry_count, 1);
        assert_eq!(pending.input_params["width"], 720);

        let task = store.get(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.current_step_index, 1);
        assert_eq!(task.pipeline_status.as_deref(), Some("pending_retry"));
        assert!(task.error_message.is_none());
        let retry = task.retry_from.unwrap();
        assert_eq!(retry.step_index, 1);
        assert_eq!(retry.result_id, pending.id);
        assert_eq!(retry.params.unwrap()["height"], 1280);
    }

    #[tokio::test]
    async fn test_retry_step_keeps_params_without_override() {
        let (store, control) = setup();
        let (task, _) = failed_at(&store, 0);

        control.retry_step(task.id, 0, None).await.unwrap();

        let results = store.step_results(task.id).unwrap();
        assert_eq!(results[1].input_params, json!({ "width": 1080, "height": 1920 }));
        assert!(store.get(task.id).unwrap().unwrap().retry_from.unwrap().params.is_none());
    }

    #[tokio::test]
    async fn test_retry_step_rejections() {
        let (store, control) = setup();
        let (task, _) = failed_at(&store, 1);

        assert!(matches!(
            control.retry_step(task.id, 5, None).await,
            Err(ControlError::StepNotFound { step_index: 5, .. })
        ));
        assert!(matches!(
            control.retry_step(999, 0, None).await,
            Err(ControlError::NotFound(999))
        ));

        // Control records are not retryable.
        store
            .insert_step_result(NewStepResult::new(
                task.id,
                CONTROL_STEP_INDEX,
                "CONTROL",
                "Task control",
                StepResultStatus::Paused,
            ))
            .unwrap();
        assert!(matches!(
            control.retry_step(task.id, CONTROL_STEP_INDEX, None).await,
            Err(ControlError::StepNotRetryable { .. })
        ));

        // Once queued, a second retry waits for the run.
        control.retry_step(task.id, 1, None).await.unwrap();
        assert!(matches!(
            control.retry_step(task.id, 1, None).await,
            Err(ControlError::InvalidState {
                action: "retry_step",
                status: TaskStatus::Queued,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_retry_step_supersedes_unrun_retry() {
        let (store, control) = setup();
        let (task, _) = failed_at(&store, 1);

        control.retry_step(task.id, 1, None).await.unwrap();
        control.pause(task.id, None).await.unwrap();
        let outcome = control
            .retry_step(task.id, 1, Some(json!({ "width": 540 })))
            .await
            .unwrap();
        assert_eq!(outcome.new_version, 3);

        let results = store.step_results(task.id).unwrap();
        assert_eq!(results[1].status, StepResultStatus::Skipped);
        assert_eq!(results[2].status, StepResultStatus::Pending);
        assert_eq!(results[2].retry_count, 2);
        assert_eq!(
            store.get(task.id).unwrap().unwrap().retry_from.unwrap().result_id,
            results[2].id
        );
    }

    #[test]
    fn test_record_interruption_requires_current_lease() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let task = store.create(fixtures::create_request(1, 1)).unwrap();
        let lease = crate::task::Lease::new(chrono::Duration::minutes(30));
        store
            .transition(
                task.id,
                TaskStatus::Processing,
                TaskUpdate::new().lease(Some(lease)),
            )
            .unwrap();

        let cancel = ControlSignal::Cancel { reason: None };
        let err = record_interruption(&store, task.id, &cancel, TaskUpdate::new().held_by("stale"))
            .unwrap_err();
        assert!(matches!(err, TaskError::LeaseLost { .. }));
        assert!(store.step_results(task.id).unwrap().is_empty());
        assert_eq!(
            store.get(task.id).unwrap().unwrap().status,
            TaskStatus::Processing
        );
    }

    #[test]
    fn test_record_interruption_versions_control_results() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let task = store.create(fixtures::create_request(1, 1)).unwrap();
        let pause = ControlSignal::Pause { reason: None };

        for _ in 0..2 {
            store
                .transition(task.id, TaskStatus::Processing, TaskUpdate::new())
                .unwrap();
            let paused = record_interruption(&store, task.id, &pause, TaskUpdate::new()).unwrap();
            assert_eq!(paused.status, TaskStatus::Paused);
            assert!(paused.control.is_empty());
            store
                .transition(task.id, TaskStatus::Queued, TaskUpdate::new())
                .unwrap();
        }

        let results = store.step_results(task.id).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.step_index == CONTROL_STEP_INDEX));
        assert_eq!(results[1].version, 2);
        assert_eq!(results[1].status, StepResultStatus::Paused);
    }
}
