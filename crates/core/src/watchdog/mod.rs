//! Watchdog: reclaims tasks stuck in `processing` or `publishing`.
//!
//! A task is stuck once it has been in a running state longer than the
//! configured threshold. Reclaimed tasks go to `error` with their lease
//! released; they are never requeued automatically.

mod config;
mod service;

pub use config::WatchdogConfig;
pub use service::Watchdog;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::audit::AuditError;
use crate::task::{TaskError, TaskStatus};

/// Tool id of the step results the watchdog writes.
pub const WATCHDOG_TOOL_ID: &str = "WATCHDOG";

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("task store error: {0}")]
    Task(#[from] TaskError),

    #[error("audit store error: {0}")]
    Audit(#[from] AuditError),
}

/// One stuck task and what the pass did about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StuckItem {
    pub task_id: i64,
    pub project_id: i64,
    pub status: TaskStatus,
    pub age_minutes: i64,
    pub threshold_minutes: i64,
    /// `marked_error`, `would_mark_error`, or `failed` when the write failed.
    pub action: String,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogSettings {
    pub stuck_processing_minutes: i64,
    pub stuck_publishing_minutes: i64,
    pub auto_requeue: bool,
}

/// Result of [`Watchdog::run_watchdog`].
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogReport {
    pub stuck_count: usize,
    pub stuck_processing: usize,
    pub stuck_publishing: usize,
    pub items: Vec<StuckItem>,
    pub dry_run: bool,
    pub run_at: DateTime<Utc>,
    pub settings: WatchdogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StuckCounts {
    pub processing: usize,
    pub publishing: usize,
}

/// A recent decision log entry, as shown in health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentDecision {
    pub action: String,
    pub project_id: Option<i64>,
    pub task_id: Option<i64>,
    pub at: DateTime<Utc>,
}

/// Result of [`Watchdog::health`].
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogHealth {
    /// Task counts keyed by status name; every status is present.
    pub counts: BTreeMap<String, i64>,
    pub stuck: StuckCounts,
    pub last_decisions: Vec<RecentDecision>,
    pub settings: WatchdogSettings,
    pub checked_at: DateTime<Utc>,
}
