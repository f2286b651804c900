//! Types shared by publisher adapters and the publish service.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::task::{PublishAttempt, TaskError, TaskStatus};

/// What an adapter uploads.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub task_id: i64,
    pub file_path: PathBuf,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

/// Result of one adapter call. Failures the adapter understood are returned
/// here with `retryable` set; only unexpected conditions surface as
/// [`AdapterError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub success: bool,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retryable: bool,
    /// Provider response, scrubbed of secrets.
    #[serde(default)]
    pub raw_response: Value,
}

impl PublishResult {
    pub fn ok(
        platform: impl Into<String>,
        external_id: impl Into<String>,
        url: Option<String>,
        raw_response: Value,
    ) -> Self {
        Self {
            success: true,
            platform: platform.into(),
            external_id: Some(external_id.into()),
            url,
            error: None,
            retryable: false,
            raw_response: super::sanitize_value(&raw_response),
        }
    }

    /// A failure no retry can fix: missing credentials, invalid input.
    pub fn fatal(platform: impl Into<String>, error: impl AsRef<str>) -> Self {
        Self::failure(platform, error, false)
    }

    pub fn retryable(platform: impl Into<String>, error: impl AsRef<str>) -> Self {
        Self::failure(platform, error, true)
    }

    /// Classify an HTTP error response.
    pub fn from_status(platform: impl Into<String>, status: u16, context: &str, body: &str) -> Self {
        let snippet: String = body.chars().take(500).collect();
        Self::failure(
            platform,
            format!("{} failed: HTTP {}: {}", context, status, snippet),
            is_retryable_status(status),
        )
    }

    fn failure(platform: impl Into<String>, error: impl AsRef<str>, retryable: bool) -> Self {
        Self {
            success: false,
            platform: platform.into(),
            external_id: None,
            url: None,
            error: Some(super::sanitize(error.as_ref())),
            retryable,
            raw_response: Value::Null,
        }
    }

    pub fn with_raw(mut self, raw_response: Value) -> Self {
        self.raw_response = super::sanitize_value(&raw_response);
        self
    }
}

/// 408, 429 and 5xx are worth retrying; every other error status is not.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Unexpected adapter failure. The publish service records it as
/// `Unhandled exception: ..` and retries.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// Errors from the publish service that leave the task untouched.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("task not found: {0}")]
    NotFound(i64),

    #[error("task {task_id} is {status}, expected ready_for_publish")]
    NotPublishable { task_id: i64, status: TaskStatus },

    #[error("task store error: {0}")]
    Task(#[from] TaskError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// What a publish request ended with.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublishOutcome {
    pub task_id: i64,
    pub published: bool,
    /// The task was already published; no adapter call was made.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub idempotent_skip: bool,
    /// Set when the request was refused without touching the task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_external_id: Option<String>,
    pub platform: String,
    pub attempts: Vec<PublishAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
