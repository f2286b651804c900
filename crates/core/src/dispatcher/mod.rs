//! Concurrency dispatcher (auto-process).
//!
//! Admits queued tasks into `processing` within the global and
//! per-destination limits, best candidate score first. Each admission is
//! committed with a lease before the task is handed to the worker pool.

mod config;
mod service;

pub use config::DispatcherConfig;
pub use service::Dispatcher;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::task::TaskError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task store error: {0}")]
    Task(#[from] TaskError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// A task admitted by a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedTask {
    pub task_id: i64,
    pub destination_id: i64,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
}

/// A task left queued, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedTask {
    pub task_id: i64,
    pub reason: String,
}

/// Running counts around a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcurrencySnapshot {
    pub global_running_before: usize,
    pub global_running_after: usize,
    pub max_parallel: usize,
    pub max_per_destination: usize,
    /// Running tasks per destination after the pass.
    pub per_dest_running: BTreeMap<i64, usize>,
}

/// Result of [`Dispatcher::run_dispatch`].
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub started_count: usize,
    pub skipped_count: usize,
    pub started: Vec<StartedTask>,
    pub skipped: Vec<SkippedTask>,
    pub concurrency: ConcurrencySnapshot,
    pub dry_run: bool,
    pub run_at: DateTime<Utc>,
}
