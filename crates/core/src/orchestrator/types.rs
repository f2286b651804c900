//! Types for the orchestrator.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approve::ApproveError;
use crate::dispatcher::DispatchError;
use crate::processor::PoolStatus;
use crate::schedule::ScheduleError;
use crate::watchdog::WatchdogError;

/// The periodic control loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Dispatch,
    Publish,
    Watchdog,
    Approve,
}

impl LoopKind {
    pub const ALL: [LoopKind; 4] = [
        LoopKind::Dispatch,
        LoopKind::Publish,
        LoopKind::Watchdog,
        LoopKind::Approve,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopKind::Dispatch => "dispatch",
            LoopKind::Publish => "publish",
            LoopKind::Watchdog => "watchdog",
            LoopKind::Approve => "approve",
        }
    }
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while running a loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Another pass of the same loop is still running.
    #[error("{0} loop is already running")]
    Busy(LoopKind),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("publish error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("watchdog error: {0}")]
    Watchdog(#[from] WatchdogError),

    #[error("auto-approve error: {0}")]
    Approve(#[from] ApproveError),
}

/// Outcome of the latest pass of a loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopRun {
    pub at: DateTime<Utc>,
    pub ok: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// State of one loop.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    /// Zero when the loop only runs on demand.
    pub interval_secs: u64,
    /// A pass is in progress right now.
    pub busy: bool,
    pub last_run: Option<LoopRun>,
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    /// Whether the periodic loops are running.
    pub running: bool,
    pub loops: BTreeMap<String, LoopStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_kind_names() {
        let names: Vec<&str> = LoopKind::ALL.iter().map(LoopKind::as_str).collect();
        assert_eq!(names, vec!["dispatch", "publish", "watchdog", "approve"]);
        assert_eq!(
            serde_json::to_string(&LoopKind::Watchdog).unwrap(),
            "\"watchdog\""
        );
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::Busy(LoopKind::Publish);
        assert_eq!(err.to_string(), "publish loop is already running");
    }
}
