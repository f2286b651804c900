//! Daily publish plan handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use clipline_core::schedule::{ApplyReport, DailyPlan};

use super::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PlanParams {
    /// `YYYY-MM-DD` in the project's timezone; today when absent.
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ApplyParams {
    pub date: Option<NaiveDate>,
    /// Also put planned tasks back into the queue where allowed.
    #[serde(default)]
    pub enqueue: bool,
}

pub async fn get_plan(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    Query(params): Query<PlanParams>,
) -> Result<Json<DailyPlan>, ApiError> {
    Ok(Json(
        state
            .planner()
            .compute_daily_plan(project_id, params.date)?,
    ))
}

pub async fn apply_plan(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    Query(params): Query<ApplyParams>,
) -> Result<Json<ApplyReport>, ApiError> {
    Ok(Json(
        state
            .planner()
            .apply_daily_plan(project_id, params.date, params.enqueue)
            .await?,
    ))
}
