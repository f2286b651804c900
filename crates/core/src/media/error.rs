//! Error types for the media toolkit.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while running ffmpeg/ffprobe.
#[derive(Debug, Error)]
pub enum MediaError {
    /// FFmpeg binary not found.
    #[error("FFmpeg not found at path: {path}")]
    FfmpegNotFound { path: PathBuf },

    /// FFprobe binary not found.
    #[error("FFprobe not found at path: {path}")]
    FfprobeNotFound { path: PathBuf },

    /// Input file not found.
    #[error("Input file not found: {path}")]
    InputNotFound { path: PathBuf },

    /// The tool exited unsuccessfully.
    #[error("{reason}")]
    CommandFailed {
        reason: String,
        stderr: Option<String>,
    },

    /// The tool ran longer than allowed and was killed.
    #[error("Media command timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// ffprobe output could not be interpreted.
    #[error("Failed to parse media info: {reason}")]
    ParseError { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    pub fn command_failed(reason: impl Into<String>, stderr: Option<String>) -> Self {
        Self::CommandFailed {
            reason: reason.into(),
            stderr,
        }
    }

    /// Whether re-running the same command could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io(_))
    }
}
