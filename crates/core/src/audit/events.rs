use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Decision and lifecycle events written to the decision log.
///
/// Every control-loop decision that mutates state produces exactly one event,
/// so an operator can reconstruct why a task was started, published, or reclaimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Service started.
    ServiceStarted {
        version: String,
        /// Hash of the loaded configuration, to spot config drift between runs.
        config_hash: String,
    },

    /// Service is shutting down.
    ServiceStopped { reason: String },

    /// A task changed lifecycle state outside of a control-loop decision.
    TaskStateChanged {
        project_id: i64,
        task_id: i64,
        from_state: String,
        to_state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// The dispatcher admitted queued tasks into processing.
    AutoProcess {
        started_count: usize,
        skipped_count: usize,
        task_ids: Vec<i64>,
    },

    /// The scheduled publisher published (or tried to publish) tasks of a project.
    AutoPublish {
        project_id: i64,
        task_ids: Vec<i64>,
        success_count: usize,
        failed_count: usize,
    },

    /// The watchdog reclaimed a stuck task.
    WatchdogStuck {
        project_id: i64,
        task_id: i64,
        old_status: String,
        age_minutes: i64,
        new_status: String,
    },

    /// A daily publish plan was applied to task priorities.
    DailyPublishPlanApply {
        project_id: i64,
        date: String,
        base_priority: i64,
        enqueue: bool,
        ok_count: usize,
        failed_count: usize,
        task_ids: Vec<i64>,
    },

    /// Candidates were approved automatically and turned into tasks.
    AutoApprove {
        project_id: i64,
        threshold: f64,
        approved_count: usize,
        skipped_count: usize,
        candidate_ids: Vec<i64>,
        task_ids: Vec<i64>,
    },

    /// An operator paused, canceled, resumed or requeued a task.
    TaskControl {
        project_id: i64,
        task_id: i64,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl AuditEvent {
    /// Returns the event type as a string for storage
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::TaskStateChanged { .. } => "task_state_changed",
            Self::AutoProcess { .. } => "auto_process",
            Self::AutoPublish { .. } => "auto_publish",
            Self::WatchdogStuck { .. } => "watchdog_stuck",
            Self::DailyPublishPlanApply { .. } => "daily_publish_plan_apply",
            Self::AutoApprove { .. } => "auto_approve",
            Self::TaskControl { .. } => "task_control",
        }
    }

    /// Project the decision belongs to, if any.
    pub fn project_id(&self) -> Option<i64> {
        match self {
            Self::TaskStateChanged { project_id, .. }
            | Self::AutoPublish { project_id, .. }
            | Self::WatchdogStuck { project_id, .. }
            | Self::DailyPublishPlanApply { project_id, .. }
            | Self::AutoApprove { project_id, .. }
            | Self::TaskControl { project_id, .. } => Some(*project_id),
            _ => None,
        }
    }

    /// Extract task_id if this event concerns a single task
    pub fn task_id(&self) -> Option<i64> {
        match self {
            Self::TaskStateChanged { task_id, .. }
            | Self::WatchdogStuck { task_id, .. }
            | Self::TaskControl { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// A stored audit record with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub project_id: Option<i64>,
    pub task_id: Option<i64>,
    pub data: AuditEvent,
}
