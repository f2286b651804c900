//! Per-run state shared by the steps of one pipeline execution.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Map, Value};

use crate::catalog::{ContentPolicy, Destination, ExportProfile, Project};
use crate::media::ProbeInfo;
use crate::task::PublishTask;

pub const RAW_VIDEO: &str = "raw.mp4";
pub const READY_VIDEO: &str = "ready.mp4";
pub const FINAL_VIDEO: &str = "final.mp4";
pub const THUMBNAIL: &str = "thumb.jpg";
pub const PREVIEW: &str = "preview.mp4";
pub const PROBE_JSON: &str = "probe.json";
pub const CAPTIONS_SRT: &str = "captions.srt";

/// Accumulator threaded through the steps of a run by `&mut`.
///
/// `current_video` is the artifact the next step reads; each transform
/// step moves it to the file it wrote. `outputs` collects every successful
/// step's output map under its tool id.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task_id: i64,
    pub project_id: i64,
    pub platform: String,
    pub work_dir: PathBuf,
    pub current_video: Option<PathBuf>,
    pub outputs: Map<String, Value>,
    pub caption_text: Option<String>,
    pub instructions: Option<String>,
    pub download_url: Option<String>,
    pub permalink: Option<String>,
    pub policy: ContentPolicy,
    pub export_profile: ExportProfile,
    pub probe: Option<ProbeInfo>,
    /// Subtitle file produced by the caption builder, if any.
    pub captions: Option<PathBuf>,
    /// Where the publish step uploads to.
    pub destination: Option<Destination>,
    logs: Vec<String>,
}

impl StepContext {
    /// Build the context for running `task`. Performs no I/O.
    pub fn for_task(
        task: &PublishTask,
        project: &Project,
        destination: Option<&Destination>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            task_id: task.id,
            project_id: task.project_id,
            platform: task.platform.clone(),
            work_dir: work_dir.into(),
            current_video: None,
            outputs: Map::new(),
            caption_text: task.caption_text.clone(),
            instructions: task.instructions.clone(),
            download_url: task.download_url.clone(),
            permalink: task.permalink.clone(),
            policy: project.policy.clone(),
            export_profile: project.export_profile.clone(),
            probe: None,
            captions: None,
            destination: destination.cloned(),
            logs: Vec::new(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    pub fn raw_path(&self) -> PathBuf {
        self.path(RAW_VIDEO)
    }

    pub fn ready_path(&self) -> PathBuf {
        self.path(READY_VIDEO)
    }

    pub fn final_path(&self) -> PathBuf {
        self.path(FINAL_VIDEO)
    }

    pub fn thumb_path(&self) -> PathBuf {
        self.path(THUMBNAIL)
    }

    pub fn preview_path(&self) -> PathBuf {
        self.path(PREVIEW)
    }

    pub fn probe_path(&self) -> PathBuf {
        self.path(PROBE_JSON)
    }

    pub fn captions_path(&self) -> PathBuf {
        self.path(CAPTIONS_SRT)
    }

    /// The video the next step should read.
    pub fn input_video(&self) -> PathBuf {
        self.current_video
            .clone()
            .unwrap_or_else(|| self.raw_path())
    }

    pub fn set_output_video(&mut self, path: impl AsRef<Path>) {
        self.current_video = Some(path.as_ref().to_path_buf());
    }

    /// Whether a step with this tool id has produced outputs in this run.
    pub fn has_output(&self, tool_id: &str) -> bool {
        self.outputs.contains_key(tool_id)
    }

    /// Append a timestamped line to the run log.
    pub fn log(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::debug!(task_id = self.task_id, "{}", message);
        self.logs
            .push(format!("[{}] {}", Utc::now().format("%H:%M:%S"), message));
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_for_task_copies_task_and_project_fields() {
        let mut project = Project::new("clips");
        project.policy.require_visual_transform = true;
        project.export_profile.width = Some(720);
        let mut task = fixtures::task(7, 1, 3);
        task.caption_text = Some("hello".to_string());

        let ctx = StepContext::for_task(&task, &project, None, "/work/7");
        assert_eq!(ctx.task_id, 7);
        assert_eq!(ctx.caption_text.as_deref(), Some("hello"));
        assert!(ctx.policy.require_visual_transform);
        assert_eq!(ctx.export_profile.width, Some(720));
        assert_eq!(ctx.raw_path(), PathBuf::from("/work/7/raw.mp4"));
        assert!(ctx.logs().is_empty());
    }

    #[test]
    fn test_current_video_defaults_to_raw() {
        let task = fixtures::task(1, 1, 1);
        let mut ctx = StepContext::for_task(&task, &Project::new("p"), None, "/w");
        assert_eq!(ctx.input_video(), PathBuf::from("/w/raw.mp4"));

        ctx.set_output_video("/w/ready.mp4");
        assert_eq!(ctx.input_video(), PathBuf::from("/w/ready.mp4"));
    }

    #[test]
    fn test_log_lines_are_timestamped() {
        let task = fixtures::task(1, 1, 1);
        let mut ctx = StepContext::for_task(&task, &Project::new("p"), None, "/w");
        ctx.log("starting");
        assert_eq!(ctx.logs().len(), 1);
        assert!(ctx.logs()[0].starts_with('['));
        assert!(ctx.logs()[0].ends_with("] starting"));
    }
}
