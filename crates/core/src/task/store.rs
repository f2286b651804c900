//! Task storage trait and request types.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{
    ControlFlags, Lease, ModerationMode, PublishAttempt, PublishTask, StepRecord, StepResult,
    StepResultStatus, StepRetry, TaskStatus,
};

/// Error type for task store operations.
#[derive(Debug)]
pub enum TaskError {
    /// Task not found.
    NotFound(i64),
    /// The requested status change is not an edge of the state machine.
    InvalidTransition {
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// The write was guarded by a lease the task no longer holds.
    LeaseLost { task_id: i64, lease_id: String },
    /// A uniqueness constraint was violated.
    Conflict(String),
    /// Database error.
    Database(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::NotFound(id) => write!(f, "Task not found: {}", id),
            TaskError::InvalidTransition { task_id, from, to } => write!(
                f,
                "Invalid transition for task {}: {} -> {}",
                task_id, from, to
            ),
            TaskError::LeaseLost { task_id, lease_id } => write!(
                f,
                "Task {} is no longer held by lease {}",
                task_id, lease_id
            ),
            TaskError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            TaskError::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for TaskError {}

/// Request to create a new task. Tasks are always created `queued`.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    pub project_id: i64,
    pub platform: String,
    pub destination_id: i64,
    pub candidate_id: Option<i64>,
    pub moderation_mode: ModerationMode,
    pub priority: i64,
    pub caption_text: Option<String>,
    pub instructions: Option<String>,
    pub download_url: Option<String>,
    pub permalink: Option<String>,
    pub artifacts: Map<String, Value>,
}

/// Sort order for task listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskOrder {
    /// Oldest first.
    #[default]
    CreatedAsc,
    /// Most recently updated first.
    UpdatedDesc,
    /// Most recently published first.
    PublishedDesc,
    /// Highest priority first, oldest first within a priority.
    PriorityDesc,
}

/// Filter for querying tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Match any of these states (empty = all).
    pub statuses: Vec<TaskStatus>,
    pub project_id: Option<i64>,
    pub destination_id: Option<i64>,
    /// Only tasks published at or after this instant.
    pub published_since: Option<DateTime<Utc>>,
    /// Only tasks published strictly before this instant.
    pub published_before: Option<DateTime<Utc>>,
    /// Only tasks created at or after this instant.
    pub created_since: Option<DateTime<Utc>>,
    pub order: TaskOrder,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
}

impl TaskFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    /// Add a state to match.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_project(mut self, project_id: i64) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_destination(mut self, destination_id: i64) -> Self {
        self.destination_id = Some(destination_id);
        self
    }

    pub fn with_published_since(mut self, since: DateTime<Utc>) -> Self {
        self.published_since = Some(since);
        self
    }

    pub fn with_published_before(mut self, before: DateTime<Utc>) -> Self {
        self.published_before = Some(before);
        self
    }

    pub fn with_created_since(mut self, since: DateTime<Utc>) -> Self {
        self.created_since = Some(since);
        self
    }

    pub fn with_order(mut self, order: TaskOrder) -> Self {
        self.order = order;
        self
    }

    /// Set limit.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Set offset.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Partial update of a task. `None` leaves a field untouched; the nested
/// `Option` on nullable fields lets a caller clear them.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub pipeline_status: Option<String>,
    pub current_step_index: Option<i64>,
    pub total_steps: Option<i64>,
    pub artifacts: Option<Map<String, Value>>,
    pub dag_debug: Option<Vec<StepRecord>>,
    pub priority: Option<i64>,
    pub published_url: Option<Option<String>>,
    pub published_external_id: Option<Option<String>>,
    pub published_at: Option<Option<DateTime<Utc>>>,
    pub publish_error: Option<Option<String>>,
    pub publish_attempts: Option<Vec<PublishAttempt>>,
    pub error_message: Option<Option<String>>,
    pub control: Option<ControlFlags>,
    pub lease: Option<Option<Lease>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_finished_at: Option<DateTime<Utc>>,
    pub publishing_started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub retry_from: Option<Option<StepRetry>>,
    /// Reject the write with [`TaskError::LeaseLost`] unless the stored
    /// task still holds this lease. Not a field of the task.
    pub held_by: Option<String>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline_status(mut self, status: impl Into<String>) -> Self {
        self.pipeline_status = Some(status.into());
        self
    }

    pub fn progress(mut self, current_step_index: i64, total_steps: i64) -> Self {
        self.current_step_index = Some(current_step_index);
        self.total_steps = Some(total_steps);
        self
    }

    pub fn artifacts(mut self, artifacts: Map<String, Value>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn dag_debug(mut self, records: Vec<StepRecord>) -> Self {
        self.dag_debug = Some(records);
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn published(
        mut self,
        url: Option<String>,
        external_id: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        self.published_url = Some(url);
        self.published_external_id = Some(external_id);
        self.published_at = Some(Some(at));
        self.publish_error = Some(None);
        self
    }

    pub fn publish_error(mut self, error: Option<String>) -> Self {
        self.publish_error = Some(error);
        self
    }

    pub fn publish_attempts(mut self, attempts: Vec<PublishAttempt>) -> Self {
        self.publish_attempts = Some(attempts);
        self
    }

    pub fn error_message(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }

    pub fn control(mut self, control: ControlFlags) -> Self {
        self.control = Some(control);
        self
    }

    pub fn lease(mut self, lease: Option<Lease>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn processing_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.processing_started_at = Some(at);
        self
    }

    pub fn processing_finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.processing_finished_at = Some(at);
        self
    }

    pub fn publishing_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.publishing_started_at = Some(at);
        self
    }

    pub fn paused_at(mut self, at: DateTime<Utc>) -> Self {
        self.paused_at = Some(at);
        self
    }

    pub fn canceled_at(mut self, at: DateTime<Utc>) -> Self {
        self.canceled_at = Some(at);
        self
    }

    pub fn retry_from(mut self, retry: Option<StepRetry>) -> Self {
        self.retry_from = Some(retry);
        self
    }

    pub fn held_by(mut self, lease_id: impl Into<String>) -> Self {
        self.held_by = Some(lease_id.into());
        self
    }

    /// Whether `task` satisfies the lease guard, if any.
    pub fn lease_matches(&self, task: &PublishTask) -> bool {
        match self.held_by {
            Some(ref lease_id) => task.lease.as_ref().map(|l| &l.id) == Some(lease_id),
            None => true,
        }
    }

    /// Apply the patch in place.
    pub fn apply(self, task: &mut PublishTask) {
        if let Some(v) = self.pipeline_status {
            task.pipeline_status = Some(v);
        }
        if let Some(v) = self.current_step_index {
            task.current_step_index = v;
        }
        if let Some(v) = self.total_steps {
            task.total_steps = v;
        }
        if let Some(v) = self.artifacts {
            task.artifacts = v;
        }
        if let Some(v) = self.dag_debug {
            task.dag_debug = v;
        }
        if let Some(v) = self.priority {
            task.priority = v;
        }
        if let Some(v) = self.published_url {
            task.published_url = v;
        }
        if let Some(v) = self.published_external_id {
            task.published_external_id = v;
        }
        if let Some(v) = self.published_at {
            task.published_at = v;
        }
        if let Some(v) = self.publish_error {
            task.publish_error = v;
        }
        if let Some(v) = self.publish_attempts {
            task.publish_attempts = v;
        }
        if let Some(v) = self.error_message {
            task.error_message = v;
        }
        if let Some(v) = self.control {
            task.control = v;
        }
        if let Some(v) = self.lease {
            task.lease = v;
        }
        if let Some(v) = self.processing_started_at {
            task.processing_started_at = Some(v);
        }
        if let Some(v) = self.processing_finished_at {
            task.processing_finished_at = Some(v);
        }
        if let Some(v) = self.publishing_started_at {
            task.publishing_started_at = Some(v);
        }
        if let Some(v) = self.paused_at {
            task.paused_at = Some(v);
        }
        if let Some(v) = self.canceled_at {
            task.canceled_at = Some(v);
        }
        if let Some(v) = self.retry_from {
            task.retry_from = v;
        }
    }
}

/// Request to persist a step result.
#[derive(Debug, Clone)]
pub struct NewStepResult {
    pub task_id: i64,
    pub step_index: i64,
    pub tool_id: String,
    pub step_name: String,
    pub status: StepResultStatus,
    pub moderation_status: String,
    pub version: i64,
    pub previous_version_id: Option<i64>,
    pub retry_count: i64,
    pub can_retry: bool,
    pub input_params: Value,
    pub output_data: Value,
    pub output_files: Vec<String>,
    pub logs: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NewStepResult {
    /// First version of a result for `(task_id, step_index)`.
    pub fn new(
        task_id: i64,
        step_index: i64,
        tool_id: impl Into<String>,
        step_name: impl Into<String>,
        status: StepResultStatus,
    ) -> Self {
        Self {
            task_id,
            step_index,
            tool_id: tool_id.into(),
            step_name: step_name.into(),
            status,
            moderation_status: "pending".to_string(),
            version: 1,
            previous_version_id: None,
            retry_count: 0,
            can_retry: false,
            input_params: Value::Object(Map::new()),
            output_data: Value::Object(Map::new()),
            output_files: Vec::new(),
            logs: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Next version in the retry chain of `previous`.
    pub fn retry_of(previous: &StepResult, status: StepResultStatus) -> Self {
        Self {
            version: previous.version + 1,
            previous_version_id: Some(previous.id),
            retry_count: previous.retry_count + 1,
            input_params: previous.input_params.clone(),
            ..Self::new(
                previous.task_id,
                previous.step_index,
                previous.tool_id.clone(),
                previous.step_name.clone(),
                status,
            )
        }
    }
}

/// Outcome written into a `pending` step result once its run finishes.
#[derive(Debug, Clone)]
pub struct StepCompletion {
    pub status: StepResultStatus,
    pub output_data: Value,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Trait for task storage backends.
///
/// Every status write goes through [`TaskStore::transition`], which rejects
/// anything that is not an edge of the state machine.
pub trait TaskStore: Send + Sync {
    /// Create a new `queued` task.
    fn create(&self, request: CreateTaskRequest) -> Result<PublishTask, TaskError>;

    /// Get a task by ID.
    fn get(&self, id: i64) -> Result<Option<PublishTask>, TaskError>;

    /// List tasks matching the filter.
    fn list(&self, filter: &TaskFilter) -> Result<Vec<PublishTask>, TaskError>;

    /// Count tasks matching the filter.
    fn count(&self, filter: &TaskFilter) -> Result<i64, TaskError>;

    /// Number of tasks in each state.
    fn count_by_status(&self) -> Result<HashMap<TaskStatus, i64>, TaskError>;

    /// Move a task to `to` and apply `update` in the same write.
    fn transition(
        &self,
        id: i64,
        to: TaskStatus,
        update: TaskUpdate,
    ) -> Result<PublishTask, TaskError>;

    /// Apply `update` without changing the status.
    fn update(&self, id: i64, update: TaskUpdate) -> Result<PublishTask, TaskError>;

    /// Persist a step result. Fails with `Conflict` when
    /// `(task_id, step_index, version)` already exists.
    fn insert_step_result(&self, result: NewStepResult) -> Result<StepResult, TaskError>;

    /// Fill in a `pending` step result. Fails with `Conflict` when the
    /// result is no longer pending.
    fn complete_step_result(
        &self,
        id: i64,
        completion: StepCompletion,
    ) -> Result<StepResult, TaskError>;

    /// Step results of a task ordered by index then version.
    fn step_results(&self, task_id: i64) -> Result<Vec<StepResult>, TaskError>;

    /// Highest step index recorded for the task, ignoring reserved indices.
    fn max_step_index(&self, task_id: i64) -> Result<Option<i64>, TaskError>;
}
