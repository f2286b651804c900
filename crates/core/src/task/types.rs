//! Core task data types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a publish task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    ReadyForReview,
    ReadyForPublish,
    Publishing,
    Published,
    Error,
    Paused,
    Canceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::ReadyForReview,
        TaskStatus::ReadyForPublish,
        TaskStatus::Publishing,
        TaskStatus::Published,
        TaskStatus::Error,
        TaskStatus::Paused,
        TaskStatus::Canceled,
    ];

    /// Storage/wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::ReadyForReview => "ready_for_review",
            TaskStatus::ReadyForPublish => "ready_for_publish",
            TaskStatus::Publishing => "publishing",
            TaskStatus::Published => "published",
            TaskStatus::Error => "error",
            TaskStatus::Paused => "paused",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// States that occupy a concurrency slot.
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Processing | TaskStatus::Publishing)
    }

    /// No edge leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Published | TaskStatus::Canceled)
    }

    /// Whether `self -> to` is an edge of the task state machine.
    ///
    /// Besides the automatic pipeline edges, the machine accepts operator
    /// edges: pause/cancel from `queued`/`processing`, approval of a reviewed
    /// task, resume of a paused task, and requeue of a failed task.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Queued, Paused)
                | (Queued, Canceled)
                | (Processing, ReadyForReview)
                | (Processing, ReadyForPublish)
                | (Processing, Error)
                | (Processing, Paused)
                | (Processing, Canceled)
                | (ReadyForReview, ReadyForPublish)
                | (ReadyForReview, Queued)
                | (ReadyForPublish, Publishing)
                | (Publishing, Published)
                | (Publishing, Error)
                | (Paused, Queued)
                | (Error, Queued)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {}", s))
    }
}

/// Who signs off on a processed task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationMode {
    /// Processed tasks wait in `ready_for_review`.
    #[default]
    Manual,
    /// Processed tasks go straight to `ready_for_publish`.
    Auto,
}

impl ModerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationMode::Manual => "manual",
            ModerationMode::Auto => "auto",
        }
    }

    /// State a successfully processed task lands in.
    pub fn success_status(&self) -> TaskStatus {
        match self {
            ModerationMode::Manual => TaskStatus::ReadyForReview,
            ModerationMode::Auto => TaskStatus::ReadyForPublish,
        }
    }
}

// ============================================================================
// Step debug trail
// ============================================================================

/// Status of one step in a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Processing,
    Ok,
    Skipped,
    Error,
}

/// One entry of a task's ordered step audit list (`dag_debug`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub id: String,
    pub tool_id: String,
    pub name: String,
    pub enabled: bool,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Publishing
// ============================================================================

/// One upload attempt made by the publish service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishAttempt {
    pub attempt: u32,
    pub platform: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Operator pause/cancel requests observed by the executor between steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl ControlFlags {
    pub fn is_empty(&self) -> bool {
        self.pause_requested_at.is_none() && self.cancel_requested_at.is_none()
    }
}

/// Reservation of a concurrency slot by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            expires_at: Utc::now() + ttl,
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// A unit of work moving content from a source through the pipeline to one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishTask {
    pub id: i64,
    pub project_id: i64,
    pub platform: String,
    pub destination_id: i64,
    /// Source candidate this task was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_status: Option<String>,
    #[serde(default)]
    pub current_step_index: i64,
    #[serde(default)]
    pub total_steps: i64,
    #[serde(default)]
    pub moderation_mode: ModerationMode,
    /// Named outputs of the pipeline (paths, media metadata, tags).
    #[serde(default)]
    pub artifacts: Map<String, Value>,
    #[serde(default)]
    pub dag_debug: Vec<StepRecord>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_error: Option<String>,
    #[serde(default)]
    pub publish_attempts: Vec<PublishAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub control: ControlFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publishing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<DateTime<Utc>>,
    /// Operator request to rerun the pipeline from one step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_from: Option<StepRetry>,
}

/// Where the next run resumes. Steps before `step_index` keep their
/// previous results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRetry {
    pub step_index: i64,
    /// Replacement parameters for the retried step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// The `pending` step result the run completes.
    pub result_id: i64,
}

impl PublishTask {
    /// Published with a recorded location; publishing again must be a no-op.
    pub fn is_published(&self) -> bool {
        self.status == TaskStatus::Published
            && (self.published_url.is_some() || self.published_external_id.is_some())
    }

    /// String-valued artifact, if present and non-empty.
    pub fn artifact_str(&self, key: &str) -> Option<&str> {
        self.artifacts
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Reference time for stuck detection in the current state.
    pub fn running_since(&self) -> DateTime<Utc> {
        let started = match self.status {
            TaskStatus::Processing => self.processing_started_at,
            TaskStatus::Publishing => self.publishing_started_at,
            _ => None,
        };
        started.unwrap_or(self.updated_at)
    }

    /// Error of the most recent failed step in the debug trail.
    pub fn last_step_error(&self) -> Option<&str> {
        self.dag_debug
            .iter()
            .rev()
            .find_map(|record| record.error.as_deref())
    }
}

// ============================================================================
// Step results
// ============================================================================

/// Outcome recorded for a persisted step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResultStatus {
    /// Retry requested, not run yet.
    Pending,
    Completed,
    Error,
    Skipped,
    Paused,
    Canceled,
}

impl StepResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepResultStatus::Pending => "pending",
            StepResultStatus::Completed => "completed",
            StepResultStatus::Error => "error",
            StepResultStatus::Skipped => "skipped",
            StepResultStatus::Paused => "paused",
            StepResultStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for StepResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepResultStatus::Pending),
            "completed" => Ok(StepResultStatus::Completed),
            "error" => Ok(StepResultStatus::Error),
            "skipped" => Ok(StepResultStatus::Skipped),
            "paused" => Ok(StepResultStatus::Paused),
            "canceled" => Ok(StepResultStatus::Canceled),
            other => Err(format!("unknown step result status: {}", other)),
        }
    }
}

/// Persisted, versioned outcome of one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub id: i64,
    pub task_id: i64,
    pub step_index: i64,
    pub tool_id: String,
    pub step_name: String,
    pub status: StepResultStatus,
    pub moderation_status: String,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version_id: Option<i64>,
    pub retry_count: i64,
    pub can_retry: bool,
    pub input_params: Value,
    pub output_data: Value,
    pub output_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Reserved step index for operator control records.
pub const CONTROL_STEP_INDEX: i64 = 9996;
/// Reserved step index for watchdog records.
pub const WATCHDOG_STEP_INDEX: i64 = 9998;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_edges() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::ReadyForReview));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::ReadyForPublish));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Error));
        assert!(TaskStatus::ReadyForPublish.can_transition_to(TaskStatus::Publishing));
        assert!(TaskStatus::Publishing.can_transition_to(TaskStatus::Published));
        assert!(TaskStatus::Publishing.can_transition_to(TaskStatus::Error));
    }

    #[test]
    fn test_operator_edges() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Canceled));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Error.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::ReadyForReview.can_transition_to(TaskStatus::ReadyForPublish));
        assert!(TaskStatus::ReadyForReview.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn test_rejected_edges() {
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Published));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::ReadyForPublish));
        assert!(!TaskStatus::Published.can_transition_to(TaskStatus::Publishing));
        assert!(!TaskStatus::Publishing.can_transition_to(TaskStatus::Paused));
        assert!(!TaskStatus::ReadyForPublish.can_transition_to(TaskStatus::Canceled));
        assert!(!TaskStatus::Canceled.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Processing));
    }

    #[test]
    fn test_terminal_states_have_no_edges() {
        for from in TaskStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_running_states() {
        let running: Vec<_> = TaskStatus::ALL.iter().filter(|s| s.is_running()).collect();
        assert_eq!(running, vec![&TaskStatus::Processing, &TaskStatus::Publishing]);
    }

    #[test]
    fn test_moderation_success_status() {
        assert_eq!(
            ModerationMode::Manual.success_status(),
            TaskStatus::ReadyForReview
        );
        assert_eq!(
            ModerationMode::Auto.success_status(),
            TaskStatus::ReadyForPublish
        );
    }
}
