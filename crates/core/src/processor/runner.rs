//! Runs the pipeline of one leased task and commits its final state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::config::ProcessorConfig;
use crate::audit::{AuditEvent, AuditHandle};
use crate::catalog::{CatalogError, CatalogStore, Project};
use crate::control::{record_interruption, ControlSignal};
use crate::executor::{
    ExecutionReport, PipelineExecutor, StepContext, StepKind, StepSpec, CAPTIONS_SRT, FINAL_VIDEO,
    PREVIEW, PROBE_JSON, RAW_VIDEO, READY_VIDEO, THUMBNAIL,
};
use crate::metrics;
use crate::task::{
    ModerationMode, NewStepResult, PublishTask, StepCompletion, StepRecord, StepResult,
    StepResultStatus, StepRetry, StepStatus, TaskError, TaskStatus, TaskStore, TaskUpdate,
};

/// Error type for processing a task.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("task not found: {0}")]
    NotFound(i64),

    /// The task is no longer in `processing`.
    #[error("task {task_id} is {status}, expected processing")]
    NotProcessing { task_id: i64, status: TaskStatus },

    /// Another reservation owns the task.
    #[error("task {task_id} is not held by lease {lease_id}")]
    LeaseMismatch { task_id: i64, lease_id: String },

    #[error("task store error: {0}")]
    Task(#[from] TaskError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// How a processing run ended.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub task_id: i64,
    pub status: TaskStatus,
    pub report: ExecutionReport,
}

/// Step list for a task.
///
/// Download (only when there is a url and no raw file yet), metadata read (T02), the
/// project preset in order with publish entries removed, thumbnail.
pub fn plan_steps(task: &PublishTask, project: &Project, raw_present: bool) -> Vec<StepSpec> {
    let mut steps = Vec::new();
    if task.download_url.is_some() && !raw_present {
        steps.push(StepSpec::new(StepKind::Download.tool_id(), json!({})));
    }
    steps.push(StepSpec::new(StepKind::Probe.tool_id(), json!({})));

    let mut preset: Vec<_> = project
        .preset
        .iter()
        .filter(|step| StepKind::from_tool_id(&step.tool_id) != StepKind::Publish)
        .collect();
    preset.sort_by_key(|step| step.order_index);
    if preset.is_empty() {
        steps.push(StepSpec::new(
            StepKind::CropResize.tool_id(),
            json!({ "width": 1080, "height": 1920 }),
        ));
    } else {
        steps.extend(
            preset
                .iter()
                .enumerate()
                .map(|(position, step)| StepSpec::from_preset(step, position)),
        );
    }

    steps.push(StepSpec::new(StepKind::Thumbnail.tool_id(), json!({})));
    steps
}

/// Prepare `steps` to continue from `retry` and return the index of the
/// retried step.
///
/// Earlier steps are disabled, except T02, whose media metadata later steps
/// read. The retried step takes the override parameters. An index past the
/// end keeps every earlier result and reruns nothing but T02.
pub fn resume_steps(steps: &mut [StepSpec], retry: &StepRetry) -> usize {
    let start = usize::try_from(retry.step_index)
        .unwrap_or(0)
        .min(steps.len());
    for step in steps.iter_mut().take(start) {
        if StepKind::from_tool_id(&step.tool_id) != StepKind::Probe {
            step.enabled = false;
        }
    }
    if let (Some(step), Some(params)) = (steps.get_mut(start), retry.params.as_ref()) {
        step.params = params.clone();
    }
    start
}

/// Carry the outputs of steps kept from the previous run into `ctx`.
fn restore_outputs(ctx: &mut StepContext, previous: &[StepRecord], start: usize) {
    for record in previous
        .iter()
        .filter(|r| r.index < start && r.status == StepStatus::Ok)
    {
        ctx.outputs
            .insert(record.tool_id.clone(), record.outputs.clone());
        if let Some(path) = record.outputs.get("path").and_then(Value::as_str) {
            let path = PathBuf::from(path);
            if path.is_file() {
                ctx.set_output_video(path);
            }
        }
    }
}

/// Debug trail of a resumed run: records of steps it skipped come from the
/// previous run.
fn merge_records(
    previous: &[StepRecord],
    current: &[StepRecord],
    start: usize,
) -> Vec<StepRecord> {
    current
        .iter()
        .map(|record| {
            let kept = previous
                .iter()
                .find(|p| p.index == record.index && p.tool_id == record.tool_id);
            match kept {
                Some(kept) if record.index < start && record.status == StepStatus::Skipped => {
                    kept.clone()
                }
                _ => record.clone(),
            }
        })
        .collect()
}

/// Processes leased tasks.
pub struct TaskProcessor {
    tasks: Arc<dyn TaskStore>,
    catalog: Arc<dyn CatalogStore>,
    executor: Arc<PipelineExecutor>,
    config: ProcessorConfig,
    audit: Option<AuditHandle>,
}

impl TaskProcessor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        catalog: Arc<dyn CatalogStore>,
        executor: Arc<PipelineExecutor>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            tasks,
            catalog,
            executor,
            config,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Run the pipeline of `task_id`, which must be `processing` under
    /// `lease_id`, and commit the resulting status.
    pub async fn process(
        &self,
        task_id: i64,
        lease_id: &str,
    ) -> Result<ProcessOutcome, ProcessError> {
        let task = self
            .tasks
            .get(task_id)?
            .ok_or(ProcessError::NotFound(task_id))?;
        if task.status != TaskStatus::Processing {
            return Err(ProcessError::NotProcessing {
                task_id,
                status: task.status,
            });
        }
        if task.lease.as_ref().map(|l| l.id.as_str()) != Some(lease_id) {
            return Err(ProcessError::LeaseMismatch {
                task_id,
                lease_id: lease_id.to_string(),
            });
        }

        let Some(project) = self.catalog.get_project(task.project_id)? else {
            let message = format!("Project {} not found", task.project_id);
            return self.fail_before_run(&task, lease_id, message).await;
        };
        let destination = self.catalog.get_destination(task.destination_id)?;

        let work_dir = self.config.task_dir(task_id);
        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            let message = format!("Cannot create work dir {}: {}", work_dir.display(), e);
            return self.fail_before_run(&task, lease_id, message).await;
        }

        let mut ctx = StepContext::for_task(&task, &project, destination.as_ref(), &work_dir);
        // A resumed run keeps the step indices of the run it continues.
        let planned_download = task
            .dag_debug
            .first()
            .is_some_and(|r| StepKind::from_tool_id(&r.tool_id) == StepKind::Download);
        let raw_present =
            ctx.raw_path().is_file() && !(task.retry_from.is_some() && planned_download);
        let mut steps = plan_steps(&task, &project, raw_present);
        let start = match task.retry_from {
            Some(ref retry) => {
                let start = resume_steps(&mut steps, retry);
                restore_outputs(&mut ctx, &task.dag_debug, start);
                info!(task_id, step_index = start, "Resuming pipeline from retried step");
                start
            }
            None => 0,
        };
        info!(task_id, steps = steps.len(), "Processing task");
        self.tasks
            .update(
                task_id,
                TaskUpdate::new()
                    .held_by(lease_id)
                    .pipeline_status("running")
                    .progress(start as i64, steps.len() as i64),
            )
            .map_err(commit_error)?;

        let report = self.executor.execute_steps(&mut ctx, &steps).await;
        let total_steps = steps.len() as i64;
        let reached = report.steps.len() as i64;
        let records = merge_records(&task.dag_debug, &report.steps, start);

        if let Some(ref signal) = report.interrupted {
            self.write_log(&work_dir, ctx.logs()).await;
            let update = TaskUpdate::new()
                .held_by(lease_id)
                .dag_debug(records)
                .progress(reached, total_steps)
                .processing_finished_at(Utc::now());
            let updated = record_interruption(self.tasks.as_ref(), task_id, signal, update)
                .map_err(commit_error)?;
            self.record_results(&task, &steps, &report.steps);
            self.finish(&task, updated.status, interruption_reason(signal)).await;
            return Ok(ProcessOutcome {
                task_id,
                status: updated.status,
                report,
            });
        }

        if report.success {
            if let Err(e) = ensure_final_video(&ctx).await {
                ctx.log(format!("Cannot prepare {}: {}", FINAL_VIDEO, e));
            }
        }
        let log_path = self.write_log(&work_dir, ctx.logs()).await;
        let artifacts = collect_artifacts(&task, &ctx, log_path.as_deref());

        // A watchdog reclaim or requeue may have handed the task to another
        // run; only the current holder commits.
        let base = TaskUpdate::new()
            .held_by(lease_id)
            .artifacts(artifacts)
            .dag_debug(records)
            .progress(reached, total_steps)
            .processing_finished_at(Utc::now())
            .retry_from(None)
            .lease(None);

        let (status, update, reason) = if report.success {
            let status = task.moderation_mode.success_status();
            (
                status,
                base.pipeline_status("completed").error_message(None),
                None,
            )
        } else {
            let message = report
                .error
                .clone()
                .unwrap_or_else(|| "Pipeline failed".to_string());
            (
                TaskStatus::Error,
                base.pipeline_status("error").error_message(Some(message.clone())),
                Some(message),
            )
        };

        self.tasks
            .transition(task_id, status, update)
            .map_err(commit_error)?;
        self.record_results(&task, &steps, &report.steps);
        self.finish(&task, status, reason).await;
        Ok(ProcessOutcome {
            task_id,
            status,
            report,
        })
    }

    async fn fail_before_run(
        &self,
        task: &PublishTask,
        lease_id: &str,
        message: String,
    ) -> Result<ProcessOutcome, ProcessError> {
        warn!(task_id = task.id, error = %message, "Task cannot be processed");
        let update = TaskUpdate::new()
            .held_by(lease_id)
            .pipeline_status("error")
            .error_message(Some(message.clone()))
            .processing_finished_at(Utc::now())
            .lease(None);
        self.tasks
            .transition(task.id, TaskStatus::Error, update)
            .map_err(commit_error)?;
        self.finish(task, TaskStatus::Error, Some(message.clone())).await;

        Ok(ProcessOutcome {
            task_id: task.id,
            status: TaskStatus::Error,
            report: ExecutionReport {
                error: Some(message),
                ..Default::default()
            },
        })
    }

    /// Persist a versioned result for every step that ran. A pending retry
    /// of the step is filled in rather than chained.
    fn record_results(&self, task: &PublishTask, steps: &[StepSpec], records: &[StepRecord]) {
        let existing = match self.tasks.step_results(task.id) {
            Ok(results) => results,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Cannot read step results, run not recorded");
                return;
            }
        };
        let moderation = match task.moderation_mode {
            ModerationMode::Manual => "pending",
            ModerationMode::Auto => "auto",
        };

        for record in records {
            let status = match record.status {
                StepStatus::Ok => StepResultStatus::Completed,
                StepStatus::Error => StepResultStatus::Error,
                _ => continue,
            };
            let index = record.index as i64;
            let latest: Option<&StepResult> = existing
                .iter()
                .filter(|r| r.step_index == index)
                .max_by_key(|r| r.version);

            if let Some(pending) = latest.filter(|r| r.status == StepResultStatus::Pending) {
                let completion = StepCompletion {
                    status,
                    output_data: record.outputs.clone(),
                    error_message: record.error.clone(),
                    started_at: record.started_at,
                    completed_at: record.finished_at,
                };
                if let Err(e) = self.tasks.complete_step_result(pending.id, completion) {
                    warn!(task_id = task.id, step_index = index, error = %e, "Failed to complete retried step");
                }
                continue;
            }

            let mut result = match latest {
                Some(previous) => NewStepResult::retry_of(previous, status),
                None => NewStepResult::new(
                    task.id,
                    index,
                    record.tool_id.clone(),
                    record.name.clone(),
                    status,
                ),
            };
            result.moderation_status = moderation.to_string();
            result.can_retry = true;
            result.input_params = steps
                .get(record.index)
                .map(|s| s.params.clone())
                .unwrap_or_default();
            result.output_data = record.outputs.clone();
            result.error_message = record.error.clone();
            result.started_at = record.started_at;
            result.completed_at = record.finished_at;
            if let Err(e) = self.tasks.insert_step_result(result) {
                warn!(task_id = task.id, step_index = index, error = %e, "Failed to record step result");
            }
        }
    }

    async fn finish(&self, task: &PublishTask, status: TaskStatus, reason: Option<String>) {
        metrics::TASK_RUNS_TOTAL
            .with_label_values(&[status.as_str()])
            .inc();
        info!(task_id = task.id, status = %status, "Task processing finished");
        if let Some(ref audit) = self.audit {
            audit
                .emit(AuditEvent::TaskStateChanged {
                    project_id: task.project_id,
                    task_id: task.id,
                    from_state: TaskStatus::Processing.as_str().to_string(),
                    to_state: status.as_str().to_string(),
                    reason,
                })
                .await;
        }
    }

    /// Append the run log to the task's log file. Returns its path.
    async fn write_log(&self, work_dir: &Path, lines: &[String]) -> Option<PathBuf> {
        let path = work_dir.join(&self.config.log_file);
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            for line in lines {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            file.flush().await
        }
        .await;
        match result {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write process log");
                None
            }
        }
    }
}

/// A lost lease surfaces as [`ProcessError::LeaseMismatch`].
fn commit_error(e: TaskError) -> ProcessError {
    match e {
        TaskError::LeaseLost { task_id, lease_id } => {
            warn!(task_id, lease_id = %lease_id, "Lease lost before commit, dropping run result");
            ProcessError::LeaseMismatch { task_id, lease_id }
        }
        other => ProcessError::Task(other),
    }
}

fn interruption_reason(signal: &ControlSignal) -> Option<String> {
    Some(match signal.reason() {
        Some(reason) => format!("{}: {}", signal.as_str(), reason),
        None => signal.as_str().to_string(),
    })
}

/// Make sure `final.mp4` exists: copy of the current video, else ready, else raw.
async fn ensure_final_video(ctx: &StepContext) -> std::io::Result<()> {
    let final_path = ctx.final_path();
    if final_path.is_file() {
        return Ok(());
    }
    let source = [ctx.input_video(), ctx.ready_path(), ctx.raw_path()]
        .into_iter()
        .find(|p| p.is_file() && *p != final_path);
    if let Some(source) = source {
        tokio::fs::copy(&source, &final_path).await?;
    }
    Ok(())
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().to_string())
}

/// Task artifacts after a run: existing entries plus every known file present.
fn collect_artifacts(
    task: &PublishTask,
    ctx: &StepContext,
    log_path: Option<&Path>,
) -> Map<String, Value> {
    let mut artifacts = task.artifacts.clone();
    let files = [
        ("raw_video", RAW_VIDEO),
        ("ready_video", READY_VIDEO),
        ("final_video", FINAL_VIDEO),
        ("thumbnail", THUMBNAIL),
        ("preview", PREVIEW),
        ("probe", PROBE_JSON),
        ("captions", CAPTIONS_SRT),
    ];
    for (key, name) in files {
        let path = ctx.path(name);
        if path.is_file() {
            artifacts.insert(key.to_string(), path_value(&path));
        }
    }

    let current = ctx.input_video();
    if current.is_file() {
        artifacts.insert("current_video".to_string(), path_value(&current));
    } else if ctx.final_path().is_file() {
        artifacts.insert("current_video".to_string(), path_value(&ctx.final_path()));
    }
    if let Some(path) = log_path {
        artifacts.insert("logs".to_string(), path_value(path));
    }
    if let Some(ref probe) = ctx.probe {
        artifacts.insert(
            "video_meta".to_string(),
            json!({
                "duration": probe.duration_secs,
                "width": probe.width,
                "height": probe.height,
                "fps": probe.fps,
                "has_audio": probe.has_audio,
            }),
        );
    }
    artifacts
}
