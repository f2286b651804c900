//! Task API handlers: listing, inspection and operator control.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use clipline_core::task::{StepResult, TaskOrder};
use clipline_core::{ControlOutcome, PublishTask, StepRetryOutcome, TaskFilter, TaskStatus};
use serde_json::Value;

use super::ApiError;
use crate::state::AppState;

/// Maximum allowed limit for task queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for task queries
const DEFAULT_LIMIT: i64 = 100;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for listing tasks
#[derive(Debug, Deserialize)]
pub struct ListTasksParams {
    /// Filter by status (e.g. `queued`, `processing`)
    pub status: Option<String>,
    pub project_id: Option<i64>,
    pub destination_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Response for listing tasks, most recently updated first
#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<PublishTask>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct TaskStepsResponse {
    pub task_id: i64,
    pub steps: Vec<StepResult>,
}

/// Optional reason for pause and cancel
#[derive(Debug, Default, Deserialize)]
pub struct ControlParams {
    pub reason: Option<String>,
}

/// Optional body of a step retry; without `params` the step reruns with
/// its previous parameters.
#[derive(Debug, Default, Deserialize)]
pub struct StepRetryRequest {
    #[serde(default, alias = "new_params")]
    pub params: Option<Value>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListTasksParams>,
) -> Result<Json<ListTasksResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = TaskFilter::new().with_order(TaskOrder::UpdatedDesc);
    if let Some(ref status) = params.status {
        let status: TaskStatus = status
            .parse()
            .map_err(|e: String| ApiError::new(axum::http::StatusCode::BAD_REQUEST, e))?;
        filter = filter.with_status(status);
    }
    if let Some(project_id) = params.project_id {
        filter = filter.with_project(project_id);
    }
    if let Some(destination_id) = params.destination_id {
        filter = filter.with_destination(destination_id);
    }

    let total = state.tasks().count(&filter)?;
    let tasks = state
        .tasks()
        .list(&filter.with_limit(limit).with_offset(offset))?;

    Ok(Json(ListTasksResponse {
        tasks,
        total,
        limit,
        offset,
    }))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<PublishTask>, ApiError> {
    state
        .tasks()
        .get(id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Task not found: {}", id)))
}

/// Step results in execution order, watchdog and control entries included.
pub async fn get_task_steps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TaskStepsResponse>, ApiError> {
    if state.tasks().get(id)?.is_none() {
        return Err(ApiError::not_found(format!("Task not found: {}", id)));
    }
    let steps = state.tasks().step_results(id)?;
    Ok(Json(TaskStepsResponse { task_id: id, steps }))
}

pub async fn pause_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<ControlParams>,
) -> Result<Json<ControlOutcome>, ApiError> {
    Ok(Json(state.control().pause(id, params.reason).await?))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<ControlParams>,
) -> Result<Json<ControlOutcome>, ApiError> {
    Ok(Json(state.control().cancel(id, params.reason).await?))
}

pub async fn resume_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ControlOutcome>, ApiError> {
    Ok(Json(state.control().resume(id).await?))
}

pub async fn requeue_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ControlOutcome>, ApiError> {
    Ok(Json(state.control().requeue(id).await?))
}

pub async fn retry_step(
    State(state): State<Arc<AppState>>,
    Path((id, step_index)): Path<(i64, i64)>,
    body: Option<Json<StepRetryRequest>>,
) -> Result<Json<StepRetryOutcome>, ApiError> {
    let params = body.and_then(|Json(request)| request.params);
    Ok(Json(state.control().retry_step(id, step_index, params).await?))
}
