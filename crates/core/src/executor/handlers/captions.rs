//! T13_BUILD_CAPTIONS and T14_BURN_CAPTIONS.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{param_str, path_arg, require_input, run_ffmpeg, skipped};
use crate::executor::{StepContext, StepError, StepHandler};
use crate::media::MediaTool;

const MAX_CUE_CHARS: usize = 200;
const SUBTITLE_STYLE: &str = "FontSize=36,Outline=2,MarginV=50,MarginL=30,MarginR=30,Spacing=8,WrapStyle=0,Alignment=2";

/// A single-cue SRT document covering `[0, seconds)`.
pub(crate) fn single_cue_srt(text: &str, seconds: u32) -> String {
    let cue: String = text.trim().chars().take(MAX_CUE_CHARS).collect();
    format!(
        "1\n00:00:00,000 --> {:02}:{:02}:{:02},000\n{}\n",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60,
        cue
    )
}

/// Escape a path for the `subtitles=` filter argument.
fn escape_filter_path(path: &Path) -> String {
    path_arg(path)
        .replace('\\', "/")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

pub(crate) fn burn_args(input: &Path, subtitles: &Path, output: &Path) -> Vec<String> {
    let filter = format!(
        "subtitles='{}':force_style='{}'",
        escape_filter_path(subtitles),
        SUBTITLE_STYLE
    );
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
    args.extend(["-vf".to_string(), filter]);
    for arg in ["-c:v", "libx264", "-preset", "medium", "-crf", "20", "-c:a", "copy"] {
        args.push(arg.to_string());
    }
    args.push(path_arg(output));
    args
}

fn caption_text(ctx: &StepContext, params: &Value) -> Option<String> {
    param_str(params, "text")
        .map(String::from)
        .or_else(|| ctx.caption_text.clone())
        .filter(|t| !t.trim().is_empty())
}

/// Writes `captions.srt` from the task's caption text.
pub struct BuildCaptionsHandler;

#[async_trait]
impl StepHandler for BuildCaptionsHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let Some(text) = caption_text(ctx, params) else {
            return Ok(skipped("no caption text"));
        };
        let path = ctx.captions_path();
        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        tokio::fs::write(&path, single_cue_srt(&text, 10)).await?;
        ctx.captions = Some(path.clone());
        ctx.log(format!("Captions written to {}", path.display()));
        Ok(json!({ "path": path_arg(&path) }))
    }
}

/// Burns subtitles into the video, writing `final.mp4`.
pub struct BurnCaptionsHandler {
    media: Arc<dyn MediaTool>,
}

impl BurnCaptionsHandler {
    pub fn new(media: Arc<dyn MediaTool>) -> Self {
        Self { media }
    }
}

#[async_trait]
impl StepHandler for BurnCaptionsHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let existing = ctx.captions.clone().filter(|p| p.is_file());
        let text = caption_text(ctx, params);
        if existing.is_none() && text.is_none() {
            return Ok(skipped("no caption text"));
        }

        let input = require_input(ctx)?;
        let subtitles = match existing {
            Some(path) => path,
            None => {
                let path = ctx.captions_path();
                let text = text.unwrap_or_default();
                tokio::fs::write(&path, single_cue_srt(&text, 5)).await?;
                ctx.captions = Some(path.clone());
                path
            }
        };

        let output = ctx.final_path();
        run_ffmpeg(self.media.as_ref(), ctx, burn_args(&input, &subtitles, &output)).await?;
        ctx.set_output_video(&output);
        Ok(json!({
            "path": path_arg(&output),
            "captions": path_arg(&subtitles),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Project;
    use crate::testing::{fixtures, MockMediaTool};

    fn context(dir: &Path, caption: Option<&str>) -> StepContext {
        let mut task = fixtures::task(1, 1, 1);
        task.caption_text = caption.map(String::from);
        StepContext::for_task(&task, &Project::new("p"), None, dir)
    }

    #[test]
    fn test_single_cue_srt() {
        let srt = single_cue_srt("  hello world ", 10);
        assert_eq!(srt, "1\n00:00:00,000 --> 00:00:10,000\nhello world\n");

        let long = "x".repeat(500);
        let srt = single_cue_srt(&long, 5);
        assert!(srt.contains(&"x".repeat(200)));
        assert!(!srt.contains(&"x".repeat(201)));
    }

    #[test]
    fn test_burn_filter_escapes_path() {
        let args = burn_args(
            Path::new("/w/in.mp4"),
            Path::new("/w/it's:here.srt"),
            Path::new("/w/final.mp4"),
        );
        let filter = &args[4];
        assert!(filter.starts_with(r"subtitles='/w/it\'s\:here.srt':force_style='FontSize=36"));
    }

    #[tokio::test]
    async fn test_build_then_burn() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("raw.mp4"), b"v").unwrap();
        let media = Arc::new(MockMediaTool::new());
        let mut ctx = context(dir.path(), Some("Wait for it"));

        BuildCaptionsHandler.execute(&mut ctx, &json!({})).await.unwrap();
        let srt = std::fs::read_to_string(dir.path().join("captions.srt")).unwrap();
        assert!(srt.contains("00:00:10,000\nWait for it"));

        let out = BurnCaptionsHandler::new(media.clone())
            .execute(&mut ctx, &json!({}))
            .await
            .unwrap();
        assert_eq!(out["path"], path_arg(&dir.path().join("final.mp4")));
        assert_eq!(ctx.input_video(), dir.path().join("final.mp4"));
        assert_eq!(media.ffmpeg_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_burn_writes_short_cue_without_built_captions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("raw.mp4"), b"v").unwrap();
        let media = Arc::new(MockMediaTool::new());
        let mut ctx = context(dir.path(), None);

        BurnCaptionsHandler::new(media.clone())
            .execute(&mut ctx, &json!({"text": "hi"}))
            .await
            .unwrap();
        let srt = std::fs::read_to_string(dir.path().join("captions.srt")).unwrap();
        assert!(srt.contains("00:00:05,000\nhi"));
    }

    #[tokio::test]
    async fn test_skipped_without_text() {
        let dir = tempfile::tempdir().unwrap();
        let media = Arc::new(MockMediaTool::new());
        let mut ctx = context(dir.path(), None);

        let out = BuildCaptionsHandler.execute(&mut ctx, &json!({})).await.unwrap();
        assert_eq!(out["skipped"], true);
        let out = BurnCaptionsHandler::new(media.clone())
            .execute(&mut ctx, &json!({}))
            .await
            .unwrap();
        assert_eq!(out["skipped"], true);
        assert!(media.ffmpeg_calls().is_empty());
    }
}
