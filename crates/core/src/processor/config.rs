//! Configuration for the task processor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for pipeline runs (`[pipeline]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Root of the per-task working directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Timeout of a single step handler in seconds.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// Name of the run log written into each task directory.
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./data/work")
}

fn default_step_timeout() -> u64 {
    600 // 10 minutes
}

fn default_log_file() -> String {
    "process.log".to_string()
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            step_timeout_secs: default_step_timeout(),
            log_file: default_log_file(),
        }
    }
}

impl ProcessorConfig {
    /// Sets the work directory root.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Sets the per-step timeout.
    pub fn with_step_timeout(mut self, secs: u64) -> Self {
        self.step_timeout_secs = secs;
        self
    }

    /// Working directory of one task.
    pub fn task_dir(&self, task_id: i64) -> PathBuf {
        self.work_dir.join(format!("task_{}", task_id))
    }
}
