//! Scheduled publishing and daily publish plans.
//!
//! The scheduled publisher runs inside per-project publish windows and
//! gates each destination on its daily quota, minimum gap and topic history
//! before handing the best ranked task to the publish service. The daily
//! plan projects the same rules onto the slots of one calendar day without
//! changing anything; applying a plan only rewrites task priorities.

mod history;
mod plan;
mod publisher;
mod window;

pub use plan::{
    slot_priority, ApplyEntry, ApplyReport, DailyPlan, DailyPlanner, DestinationPlan, PlanSkip,
    PlanSlot, PlanSummary, DEFAULT_BASE_PRIORITY,
};
pub use publisher::ScheduledPublisher;
pub use window::{
    compute_slots, day_key, hours_before, in_window, local_day_bounds, resolve_timezone,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::selector::RankDebug;
use crate::task::TaskError;

/// Tool id recorded on step results written by the scheduler.
pub const PUBLISH_TOOL_ID: &str = "P01_PUBLISH";

/// Tasks considered per project and pass.
pub const ELIGIBLE_LIMIT: i64 = 20;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("project not found: {0}")]
    ProjectNotFound(i64),

    #[error("task store error: {0}")]
    Task(#[from] TaskError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// A task the publisher acted on (or would have, in a dry run).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishStarted {
    pub project_id: i64,
    pub task_id: i64,
    pub destination_id: i64,
    pub score: Option<f64>,
    pub effective_score: f64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A task (or a whole project, when `task_id` is empty) left alone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishSkipped {
    pub project_id: i64,
    pub task_id: Option<i64>,
    pub reason: String,
    /// Number of tasks covered by a project-wide skip.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
}

/// Top of the ranking of one project, for operator inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectRanking {
    pub project_id: i64,
    pub top: Vec<RankDebug>,
}

/// Result of one scheduled publish pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishRunReport {
    pub started_count: usize,
    pub skipped_count: usize,
    pub started: Vec<PublishStarted>,
    pub skipped: Vec<PublishSkipped>,
    pub ordered_by: String,
    pub ranking: Vec<ProjectRanking>,
    /// The pass stopped early because the service is shutting down.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
    pub dry_run: bool,
    pub run_at: DateTime<Utc>,
}

impl PublishRunReport {
    fn new(run_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            started_count: 0,
            skipped_count: 0,
            started: Vec::new(),
            skipped: Vec::new(),
            ordered_by: "effective_score".to_string(),
            ranking: Vec::new(),
            interrupted: false,
            dry_run,
            run_at,
        }
    }

    fn skip(&mut self, project_id: i64, task_id: Option<i64>, reason: impl Into<String>) {
        self.skipped.push(PublishSkipped {
            project_id,
            task_id,
            reason: reason.into(),
            count: None,
        });
    }

    fn finish(mut self) -> Self {
        self.started_count = self.started.len();
        self.skipped_count = self.skipped.len();
        self
    }
}
