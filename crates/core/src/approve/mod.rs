//! Automatic approval of high-scoring candidates.
//!
//! For every project with auto-approve enabled, new candidates scoring at or
//! above the project threshold are ranked with the diversity selector and
//! run through a fixed sequence of gates. Survivors are approved and get a
//! `queued` task on the first active destination that still has room today.

mod dedup;
mod service;

pub use dedup::{
    hamming_distance, parse_simhash, simhash_hex, text_simhash, CatalogDuplicateDetector,
    DuplicateDetector,
};
pub use service::{approve_threshold, AutoApprover};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::selector::RankDebug;
use crate::task::TaskError;

/// Threshold used when neither an override nor a calibration exists.
pub const DEFAULT_THRESHOLD: f64 = 0.70;

/// New candidates considered per project and pass.
pub const MAX_CANDIDATES_PER_RUN: i64 = 100;

#[derive(Debug, Error)]
pub enum ApproveError {
    #[error("project not found: {0}")]
    ProjectNotFound(i64),

    #[error("task store error: {0}")]
    Task(#[from] TaskError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// A candidate that was approved (or would be, in a dry run).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovedItem {
    pub candidate_id: i64,
    /// Created task; empty in a dry run.
    pub task_id: Option<i64>,
    pub destination_id: i64,
    pub destination_platform: String,
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
}

/// A candidate left alone, with the gate that stopped it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApproveSkip {
    pub candidate_id: i64,
    pub score: Option<f64>,
    pub reason: String,
}

/// Task creation budget of one destination for the current local day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyUsage {
    pub platform: String,
    pub used: i64,
    pub limit: i64,
}

/// Result of auto-approve for one project.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApproveReport {
    pub project_id: i64,
    pub threshold: f64,
    pub approved_count: usize,
    pub skipped_count: usize,
    pub approved: Vec<ApprovedItem>,
    pub skipped: Vec<ApproveSkip>,
    /// Skip count per gate (the reason up to its first `:`).
    pub skipped_reasons_breakdown: BTreeMap<String, usize>,
    pub ordered_by: String,
    pub ranking_debug: Vec<RankDebug>,
    /// Keyed by destination id.
    pub daily_limits: BTreeMap<i64, DailyUsage>,
    /// Set when the project could not be processed at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dry_run: bool,
    pub run_at: DateTime<Utc>,
}

impl ApproveReport {
    fn new(project_id: i64, threshold: f64, now: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            project_id,
            threshold,
            approved_count: 0,
            skipped_count: 0,
            approved: Vec::new(),
            skipped: Vec::new(),
            skipped_reasons_breakdown: BTreeMap::new(),
            ordered_by: "effective_score".to_string(),
            ranking_debug: Vec::new(),
            daily_limits: BTreeMap::new(),
            error: None,
            dry_run,
            run_at: now,
        }
    }

    fn finish(mut self) -> Self {
        self.approved_count = self.approved.len();
        self.skipped_count = self.skipped.len();
        for skip in &self.skipped {
            let key = skip.reason.split(':').next().unwrap_or_default();
            *self
                .skipped_reasons_breakdown
                .entry(key.to_string())
                .or_insert(0) += 1;
        }
        self
    }
}

/// Failure of one project during a pass over all projects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectFailure {
    pub project_id: i64,
    pub error: String,
}

/// Result of one auto-approve pass over every enabled project.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApproveRunReport {
    pub processed: usize,
    pub total_approved: usize,
    pub projects: Vec<ApproveReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ProjectFailure>,
    pub dry_run: bool,
    pub run_at: DateTime<Utc>,
}
