//! Orchestrator configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the control-loop driver (`[orchestrator]` section).
///
/// An interval of zero disables that loop; it can still be triggered
/// through the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Enable/disable the periodic loops.
    /// When disabled, loops must be triggered manually via API.
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between dispatch passes.
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_secs: u64,

    /// Seconds between scheduled publish passes.
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,

    /// Seconds between watchdog passes.
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,

    /// Seconds between auto-approve passes.
    #[serde(default = "default_approve_interval")]
    pub approve_interval_secs: u64,

    /// How long shutdown waits for loops and running tasks.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_dispatch_interval() -> u64 {
    15
}

fn default_publish_interval() -> u64 {
    60
}

fn default_watchdog_interval() -> u64 {
    300
}

fn default_approve_interval() -> u64 {
    600
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dispatch_interval_secs: default_dispatch_interval(),
            publish_interval_secs: default_publish_interval(),
            watchdog_interval_secs: default_watchdog_interval(),
            approve_interval_secs: default_approve_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}
