//! JSON error responses shared by every handler.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use clipline_core::{
    AuditError, ControlError, OrchestratorError, ScheduleError, TaskError, WatchdogError,
};

/// Body of every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// An error status with a message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, "{}", self.message);
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        let status = match e {
            TaskError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskError::InvalidTransition { .. }
            | TaskError::LeaseLost { .. }
            | TaskError::Conflict(_) => StatusCode::CONFLICT,
            TaskError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::NotFound(_) => Self::not_found(e.to_string()),
            ControlError::StepNotFound { .. } => Self::not_found(e.to_string()),
            ControlError::InvalidState { .. } => Self::new(StatusCode::CONFLICT, e.to_string()),
            ControlError::StepNotRetryable { .. } => {
                Self::new(StatusCode::BAD_REQUEST, e.to_string())
            }
            ControlError::Task(inner) => inner.into(),
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::ProjectNotFound(_) => Self::not_found(e.to_string()),
            ScheduleError::Task(inner) => inner.into(),
            ScheduleError::Catalog(_) => Self::internal(e.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Busy(_) => Self::new(StatusCode::CONFLICT, e.to_string()),
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<WatchdogError> for ApiError {
    fn from(e: WatchdogError) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<AuditError> for ApiError {
    fn from(e: AuditError) -> Self {
        Self::internal(format!("Failed to query audit events: {}", e))
    }
}
