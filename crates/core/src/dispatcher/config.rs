//! Admission limits for the dispatcher.

use serde::{Deserialize, Serialize};

/// Configuration for the concurrency dispatcher (`[dispatcher]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Tasks allowed in `processing` + `publishing` at once, globally.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Running tasks allowed per destination.
    #[serde(default = "default_max_per_destination")]
    pub max_parallel_per_destination: usize,

    /// How many queued tasks one pass looks at.
    #[serde(default = "default_scan_limit")]
    pub scan_limit: i64,

    /// Lifetime of a processing reservation.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_minutes: i64,
}

fn default_max_parallel() -> usize {
    2
}

fn default_max_per_destination() -> usize {
    1
}

fn default_scan_limit() -> i64 {
    50
}

fn default_lease_ttl() -> i64 {
    120
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_parallel_per_destination: default_max_per_destination(),
            scan_limit: default_scan_limit(),
            lease_ttl_minutes: default_lease_ttl(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_limits(mut self, global: usize, per_destination: usize) -> Self {
        self.max_parallel = global;
        self.max_parallel_per_destination = per_destination;
        self
    }
}
