use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{audit, handlers, loops, middleware::metrics_middleware, plans, tasks};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        .route("/orchestrator/status", get(handlers::orchestrator_status))
        // Audit
        .route("/audit", get(audit::query_audit))
        // Tasks
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/steps", get(tasks::get_task_steps))
        .route("/tasks/{id}/pause", post(tasks::pause_task))
        .route("/tasks/{id}/cancel", post(tasks::cancel_task))
        .route("/tasks/{id}/resume", post(tasks::resume_task))
        .route("/tasks/{id}/requeue", post(tasks::requeue_task))
        .route("/tasks/{id}/steps/{index}/retry", post(tasks::retry_step))
        // Control loops
        .route("/loops/dispatch", post(loops::run_dispatch))
        .route("/loops/publish", post(loops::run_publish))
        .route("/loops/watchdog", post(loops::run_watchdog))
        .route("/loops/approve", post(loops::run_approve))
        .route("/watchdog/health", get(loops::watchdog_health))
        // Daily plans
        .route("/projects/{id}/plan", get(plans::get_plan))
        .route("/projects/{id}/plan/apply", post(plans::apply_plan));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::metrics))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
