//! Stuck-task thresholds.

use serde::{Deserialize, Serialize};

/// Configuration for the watchdog (`[watchdog]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_stuck_processing")]
    pub stuck_processing_minutes: i64,

    #[serde(default = "default_stuck_publishing")]
    pub stuck_publishing_minutes: i64,

    /// Reported in watchdog reports. Stuck tasks are never requeued
    /// automatically; an operator requeues them after diagnosis.
    #[serde(default)]
    pub auto_requeue: bool,
}

fn default_stuck_processing() -> i64 {
    90
}

fn default_stuck_publishing() -> i64 {
    30
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stuck_processing_minutes: default_stuck_processing(),
            stuck_publishing_minutes: default_stuck_publishing(),
            auto_requeue: false,
        }
    }
}

impl WatchdogConfig {
    pub fn with_thresholds(mut self, processing_minutes: i64, publishing_minutes: i64) -> Self {
        self.stuck_processing_minutes = processing_minutes;
        self.stuck_publishing_minutes = publishing_minutes;
        self
    }
}
