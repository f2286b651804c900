//! Mock media tool.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::media::{MediaError, MediaTool, ProbeInfo};

/// Records ffmpeg invocations instead of running them.
///
/// Each successful ffmpeg call writes a small placeholder file at the
/// output path (the last argument) so the next step finds its input.
#[derive(Debug)]
pub struct MockMediaTool {
    probe: Mutex<ProbeInfo>,
    calls: Mutex<Vec<Vec<String>>>,
    probed: Mutex<Vec<PathBuf>>,
    ffmpeg_error: Mutex<Option<String>>,
}

impl Default for MockMediaTool {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMediaTool {
    /// Probes report a healthy 1080x1920 clip with audio.
    pub fn new() -> Self {
        Self {
            probe: Mutex::new(ProbeInfo {
                duration_secs: Some(30.0),
                width: Some(1080),
                height: Some(1920),
                fps: Some(30.0),
                video_codec: Some("h264".to_string()),
                audio_codec: Some("aac".to_string()),
                audio_sample_rate: Some("48000".to_string()),
                bit_rate: Some(4_000_000),
                size_bytes: Some(15_000_000),
                has_video: true,
                has_audio: true,
                raw: serde_json::json!({ "streams": [], "format": {} }),
            }),
            calls: Mutex::new(Vec::new()),
            probed: Mutex::new(Vec::new()),
            ffmpeg_error: Mutex::new(None),
        }
    }

    pub fn set_probe(&self, info: ProbeInfo) {
        *self.probe.lock().unwrap() = info;
    }

    /// Make every following ffmpeg call fail with `message`.
    pub fn fail_ffmpeg(&self, message: impl Into<String>) {
        *self.ffmpeg_error.lock().unwrap() = Some(message.into());
    }

    /// Argument lists of every ffmpeg call, in order.
    pub fn ffmpeg_calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Paths passed to `probe`, in order.
    pub fn probed(&self) -> Vec<PathBuf> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaTool for MockMediaTool {
    fn name(&self) -> &str {
        "mock"
    }

    async fn probe(&self, path: &Path) -> Result<ProbeInfo, MediaError> {
        self.probed.lock().unwrap().push(path.to_path_buf());
        Ok(self.probe.lock().unwrap().clone())
    }

    async fn ffmpeg(&self, args: &[String]) -> Result<(), MediaError> {
        self.calls.lock().unwrap().push(args.to_vec());
        if let Some(message) = self.ffmpeg_error.lock().unwrap().clone() {
            return Err(MediaError::command_failed(message, None));
        }
        if let Some(output) = args.last() {
            tokio::fs::write(output, b"mock-video").await?;
        }
        Ok(())
    }

    async fn validate(&self) -> Result<(), MediaError> {
        Ok(())
    }
}
