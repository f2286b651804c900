//! FFmpeg/ffprobe subprocess implementation of [`MediaTool`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use super::{MediaConfig, MediaError, MediaTool, ProbeInfo};

/// Tail of stderr kept in error messages.
const STDERR_TAIL: usize = 400;

/// Runs the system ffmpeg/ffprobe binaries.
pub struct FfmpegTool {
    config: MediaConfig,
}

impl FfmpegTool {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(MediaConfig::default())
    }

    /// Prepend the global flags every ffmpeg run gets.
    fn build_args(&self, args: &[String]) -> Vec<String> {
        let mut full = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-loglevel".to_string(),
            self.config.ffmpeg_log_level.clone(),
        ];
        full.extend(args.iter().cloned());
        full
    }

    /// Run `program` to completion under the configured timeout.
    ///
    /// The child is killed if the timeout fires.
    async fn run_bounded(
        &self,
        program: &Path,
        args: &[String],
        not_found: impl FnOnce(PathBuf) -> MediaError,
    ) -> Result<std::process::Output, MediaError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    not_found(program.to_path_buf())
                } else {
                    MediaError::Io(e)
                }
            })?;

        match timeout(
            Duration::from_secs(self.config.timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(output) => Ok(output?),
            Err(_) => Err(MediaError::Timeout {
                timeout_secs: self.config.timeout_secs,
            }),
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

#[async_trait]
impl MediaTool for FfmpegTool {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn probe(&self, path: &Path) -> Result<ProbeInfo, MediaError> {
        if !path.exists() {
            return Err(MediaError::InputNotFound {
                path: path.to_path_buf(),
            });
        }

        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_streams".to_string(),
            "-show_format".to_string(),
            path.to_string_lossy().to_string(),
        ];
        let output = self
            .run_bounded(&self.config.ffprobe_path, &args, |path| {
                MediaError::FfprobeNotFound { path }
            })
            .await?;

        if !output.status.success() {
            let tail = stderr_tail(&output.stderr);
            return Err(MediaError::command_failed(
                format!("ffprobe failed with code {:?}: {}", output.status.code(), tail),
                Some(tail),
            ));
        }

        ProbeInfo::parse(&String::from_utf8_lossy(&output.stdout))
    }

    async fn ffmpeg(&self, args: &[String]) -> Result<(), MediaError> {
        let full = self.build_args(args);
        tracing::debug!(args = ?full, "Running ffmpeg");

        let output = self
            .run_bounded(&self.config.ffmpeg_path, &full, |path| {
                MediaError::FfmpegNotFound { path }
            })
            .await?;

        if !output.status.success() {
            let tail = stderr_tail(&output.stderr);
            return Err(MediaError::command_failed(
                format!("ffmpeg failed with code {:?}: {}", output.status.code(), tail),
                Some(tail),
            ));
        }
        Ok(())
    }

    async fn validate(&self) -> Result<(), MediaError> {
        let version = vec!["-version".to_string()];
        self.run_bounded(&self.config.ffmpeg_path, &version, |path| {
            MediaError::FfmpegNotFound { path }
        })
        .await?;
        self.run_bounded(&self.config.ffprobe_path, &version, |path| {
            MediaError::FfprobeNotFound { path }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_prefix_user_args() {
        let tool = FfmpegTool::with_defaults();
        let args = tool.build_args(&["-y".to_string(), "out.mp4".to_string()]);
        assert_eq!(&args[..4], &["-hide_banner", "-nostdin", "-loglevel", "error"]);
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = "x".repeat(1000) + "boom";
        let tail = stderr_tail(long.as_bytes());
        assert_eq!(tail.chars().count(), STDERR_TAIL);
        assert!(tail.ends_with("boom"));
        assert_eq!(stderr_tail(b"  short \n"), "short");
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let tool = FfmpegTool::new(MediaConfig {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg-clipline"),
            ..MediaConfig::default()
        });
        let err = tool.ffmpeg(&["-version".to_string()]).await.unwrap_err();
        assert!(matches!(err, MediaError::FfmpegNotFound { .. }));
    }

    #[tokio::test]
    async fn test_probe_missing_input() {
        let tool = FfmpegTool::with_defaults();
        let err = tool
            .probe(Path::new("/nonexistent/clip.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::InputNotFound { .. }));
    }
}
