//! Manual triggers for the control loops.
//!
//! A trigger while the same loop is mid-pass answers 409.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use clipline_core::approve::ApproveRunReport;
use clipline_core::schedule::PublishRunReport;
use clipline_core::watchdog::WatchdogHealth;
use clipline_core::{DispatchReport, WatchdogReport};

use super::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RunParams {
    #[serde(default)]
    pub dry_run: bool,
}

pub async fn run_dispatch(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
) -> Result<Json<DispatchReport>, ApiError> {
    Ok(Json(state.orchestrator().run_dispatch(params.dry_run).await?))
}

pub async fn run_publish(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
) -> Result<Json<PublishRunReport>, ApiError> {
    Ok(Json(state.orchestrator().run_publish(params.dry_run).await?))
}

pub async fn run_watchdog(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
) -> Result<Json<WatchdogReport>, ApiError> {
    Ok(Json(state.orchestrator().run_watchdog(params.dry_run).await?))
}

pub async fn run_approve(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
) -> Result<Json<ApproveRunReport>, ApiError> {
    Ok(Json(
        state.orchestrator().run_auto_approve(params.dry_run).await?,
    ))
}

pub async fn watchdog_health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<WatchdogHealth>, ApiError> {
    Ok(Json(state.orchestrator().watchdog_health()?))
}
