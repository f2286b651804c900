//! Media toolkit: the ffmpeg/ffprobe boundary used by pipeline steps.

mod config;
mod error;
mod ffmpeg;
mod types;

pub use config::MediaConfig;
pub use error::MediaError;
pub use ffmpeg::FfmpegTool;
pub use types::ProbeInfo;

use async_trait::async_trait;
use std::path::Path;

/// Subprocess boundary for video work.
///
/// Step handlers build ffmpeg argument lists; implementations decide how
/// they are run. Tests substitute a recording fake.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Name of this implementation.
    fn name(&self) -> &str;

    /// Inspect a media file.
    async fn probe(&self, path: &Path) -> Result<ProbeInfo, MediaError>;

    /// Run ffmpeg with the given arguments (input and output included).
    async fn ffmpeg(&self, args: &[String]) -> Result<(), MediaError>;

    /// Check that the binaries are available.
    async fn validate(&self) -> Result<(), MediaError>;
}
