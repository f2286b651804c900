//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Control loops (dispatch, publish, watchdog, auto-approve)
//! - Pipeline steps
//! - Publishing

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Control loops
// =============================================================================

/// Loop invocations by loop name and outcome.
pub static LOOP_RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("clipline_loop_runs_total", "Total control loop invocations"),
        &["loop", "result"], // result: "ok", "error", "busy"
    )
    .unwrap()
});

/// Loop pass duration in seconds.
pub static LOOP_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "clipline_loop_duration_seconds",
            "Duration of one control loop pass",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["loop"],
    )
    .unwrap()
});

/// Tasks admitted into `processing` by the dispatcher.
pub static TASKS_DISPATCHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "clipline_tasks_dispatched_total",
        "Total tasks admitted by the dispatcher",
    )
    .unwrap()
});

/// Candidates approved by auto-approve.
pub static TASKS_APPROVED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "clipline_candidates_approved_total",
        "Total candidates approved automatically",
    )
    .unwrap()
});

/// Tasks reclaimed by the watchdog, by the state they were stuck in.
pub static WATCHDOG_RECLAIMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "clipline_watchdog_reclaimed_total",
            "Total stuck tasks moved to error by the watchdog",
        ),
        &["status"],
    )
    .unwrap()
});

// =============================================================================
// Pipeline
// =============================================================================

/// Step duration by tool id and outcome.
pub static STEP_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("clipline_step_duration_seconds", "Duration of pipeline steps")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 180.0, 600.0]),
        &["tool_id", "status"], // status: "ok", "error"
    )
    .unwrap()
});

/// Task runs currently executing in the worker pool.
pub static WORKER_POOL_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "clipline_worker_pool_active",
        "Task runs currently executing",
    )
    .unwrap()
});

/// Finished task runs by final status.
pub static TASK_RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("clipline_task_runs_total", "Total finished task runs"),
        &["status"],
    )
    .unwrap()
});

// =============================================================================
// Publishing
// =============================================================================

/// Upload attempts by platform and outcome.
pub static PUBLISH_ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("clipline_publish_attempts_total", "Total upload attempts"),
        &["platform", "outcome"], // outcome: "success", "retryable", "fatal"
    )
    .unwrap()
});

/// Get all metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Loops
        Box::new(LOOP_RUNS_TOTAL.clone()),
        Box::new(LOOP_DURATION_SECONDS.clone()),
        Box::new(TASKS_DISPATCHED_TOTAL.clone()),
        Box::new(TASKS_APPROVED_TOTAL.clone()),
        Box::new(WATCHDOG_RECLAIMED_TOTAL.clone()),
        // Pipeline
        Box::new(STEP_DURATION_SECONDS.clone()),
        Box::new(WORKER_POOL_ACTIVE.clone()),
        Box::new(TASK_RUNS_TOTAL.clone()),
        // Publishing
        Box::new(PUBLISH_ATTEMPTS_TOTAL.clone()),
    ]
}
