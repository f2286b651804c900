//! Idempotent, retrying publish of one task.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use super::{
    sanitize, PublishError, PublishOutcome, PublishResult, PublisherConfig, PublisherRegistry,
    UploadRequest,
};
use crate::catalog::{CandidateStatus, CatalogStore};
use crate::metrics;
use crate::sleeper::Sleeper;
use crate::task::{PublishAttempt, PublishTask, TaskStatus, TaskStore, TaskUpdate};

/// Fallback file names searched in the task work dir, best first.
const VIDEO_FALLBACKS: [&str; 3] = ["final.mp4", "ready.mp4", "output.mp4"];

/// Video to upload: the `current_video` artifact when it exists, otherwise
/// the first fallback file present in `work_dir`.
pub fn resolve_video(task: &PublishTask, work_dir: &Path) -> Option<PathBuf> {
    if let Some(current) = task.artifact_str("current_video") {
        let path = PathBuf::from(current);
        if path.is_file() {
            return Some(path);
        }
    }
    VIDEO_FALLBACKS
        .iter()
        .map(|name| work_dir.join(name))
        .find(|path| path.is_file())
}

/// Tags from the `tags` or `hashtags` artifact (array or delimited string).
fn task_tags(task: &PublishTask) -> Vec<String> {
    let raw = task
        .artifacts
        .get("tags")
        .or_else(|| task.artifacts.get("hashtags"));
    let tags: Vec<String> = match raw {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        Some(Value::String(s)) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    };
    tags.into_iter()
        .map(|t| t.trim().trim_start_matches('#').to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn upload_request(task: &PublishTask, file_path: PathBuf) -> UploadRequest {
    let title = task
        .caption_text
        .clone()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| task.instructions.clone().filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| format!("Video #{}", task.id));
    UploadRequest {
        task_id: task.id,
        file_path,
        title,
        description: task.caption_text.clone().unwrap_or_default(),
        tags: task_tags(task),
    }
}

/// Releases the in-flight slot of a task when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<i64>>,
    task_id: i64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.task_id);
    }
}

/// Publishes tasks through the registered adapters.
pub struct PublishService {
    tasks: Arc<dyn TaskStore>,
    catalog: Arc<dyn CatalogStore>,
    registry: Arc<PublisherRegistry>,
    sleeper: Arc<dyn Sleeper>,
    config: PublisherConfig,
    in_flight: Mutex<HashSet<i64>>,
}

impl PublishService {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        catalog: Arc<dyn CatalogStore>,
        registry: Arc<PublisherRegistry>,
        sleeper: Arc<dyn Sleeper>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            tasks,
            catalog,
            registry,
            sleeper,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    fn claim(&self, task_id: i64) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(task_id).then(|| InFlight {
            set: &self.in_flight,
            task_id,
        })
    }

    /// Publish a `ready_for_publish` task.
    ///
    /// An already published task returns its recorded location without
    /// calling the adapter. Failures after the task entered `publishing`
    /// are reported in the outcome and leave the task in `error`.
    pub async fn publish_task(
        &self,
        task_id: i64,
        work_dir: &Path,
    ) -> Result<PublishOutcome, PublishError> {
        let task = self
            .tasks
            .get(task_id)?
            .ok_or(PublishError::NotFound(task_id))?;

        let mut outcome = PublishOutcome {
            task_id,
            platform: task.platform.clone(),
            ..Default::default()
        };

        if task.is_published() {
            info!(task_id, "Task already published, skipping upload");
            outcome.published = true;
            outcome.idempotent_skip = true;
            outcome.published_url = task.published_url.clone();
            outcome.published_external_id = task.published_external_id.clone();
            return Ok(outcome);
        }

        let Some(_guard) = self.claim(task_id) else {
            warn!(task_id, "Publish already running in this process");
            outcome.skipped_reason = Some("concurrent_publish_in_progress".to_string());
            return Ok(outcome);
        };

        match task.status {
            TaskStatus::ReadyForPublish => {}
            TaskStatus::Publishing => {
                outcome.skipped_reason = Some("already_publishing".to_string());
                return Ok(outcome);
            }
            status => return Err(PublishError::NotPublishable { task_id, status }),
        }

        let task = self.tasks.transition(
            task_id,
            TaskStatus::Publishing,
            TaskUpdate::new()
                .publishing_started_at(Utc::now())
                .pipeline_status("publishing"),
        )?;

        let destination = match self.catalog.get_destination(task.destination_id) {
            Ok(Some(destination)) => destination,
            Ok(None) => {
                let message = format!("P01_PUBLISH: destination {} not found", task.destination_id);
                return self.fail(&task, outcome, Vec::new(), message);
            }
            Err(e) => return self.fail(&task, outcome, Vec::new(), format!("P01_PUBLISH: {}", e)),
        };
        let Some(adapter) = self.registry.get(&destination.platform) else {
            let message = format!("P01_PUBLISH: no adapter for platform {}", destination.platform);
            return self.fail(&task, outcome, Vec::new(), message);
        };
        let Some(video) = resolve_video(&task, work_dir) else {
            let message = format!("P01_PUBLISH: no output video found in {}", work_dir.display());
            return self.fail(&task, outcome, Vec::new(), message);
        };

        let upload = upload_request(&task, video);
        let platform = adapter.platform().to_string();
        outcome.platform = platform.clone();
        let max_attempts = self.config.max_attempts.max(1);
        let request_timeout = Duration::from_secs(self.config.request_timeout_secs);
        let mut log = task.publish_attempts.clone();
        let mut last: Option<PublishResult> = None;

        for attempt in 1..=max_attempts {
            let started_at = Utc::now();
            let started = Instant::now();
            info!(task_id, platform = %platform, attempt, max_attempts, "Publishing");

            let result = match tokio::time::timeout(
                request_timeout,
                adapter.publish(&destination, &upload),
            )
            .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    PublishResult::retryable(&platform, format!("Unhandled exception: {}", e))
                }
                Err(_) => PublishResult::retryable(
                    &platform,
                    format!("Publish request timed out after {}s", request_timeout.as_secs()),
                ),
            };

            let entry = PublishAttempt {
                attempt,
                platform: platform.clone(),
                started_at,
                finished_at: Utc::now(),
                duration_ms: started.elapsed().as_millis() as u64,
                success: result.success,
                error: result.error.as_deref().map(sanitize),
                retryable: result.retryable,
                external_id: result.external_id.clone(),
                url: result.url.clone(),
            };
            let label = if result.success {
                "success"
            } else if result.retryable {
                "retryable"
            } else {
                "fatal"
            };
            metrics::PUBLISH_ATTEMPTS_TOTAL
                .with_label_values(&[platform.as_str(), label])
                .inc();
            log.push(entry.clone());
            outcome.attempts.push(entry);
            if let Err(e) = self
                .tasks
                .update(task_id, TaskUpdate::new().publish_attempts(log.clone()))
            {
                warn!(task_id, error = %e, "Failed to persist publish attempt");
            }

            if result.success {
                last = Some(result);
                break;
            }

            warn!(
                task_id,
                platform = %platform,
                attempt,
                retryable = result.retryable,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Publish attempt failed"
            );
            let retry = result.retryable && attempt < max_attempts;
            last = Some(result);
            if !retry {
                break;
            }

            let delay = self.config.backoff_after(attempt);
            if self.sleeper.sleep(Duration::from_secs(delay)).await.is_err() {
                warn!(task_id, "Publish retry interrupted by shutdown");
                break;
            }
        }

        match last {
            Some(result) if result.success => {
                let updated = self.tasks.transition(
                    task_id,
                    TaskStatus::Published,
                    TaskUpdate::new()
                        .published(result.url.clone(), result.external_id.clone(), Utc::now())
                        .publish_attempts(log)
                        .pipeline_status("published")
                        .lease(None),
                )?;
                self.mark_candidate_used(&updated);
                info!(task_id, url = ?result.url, "Task published");
                outcome.published = true;
                outcome.published_url = result.url;
                outcome.published_external_id = result.external_id;
                Ok(outcome)
            }
            result => {
                let error = result
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| "unknown error".to_string());
                let count = outcome.attempts.len();
                let message = format!("P01_PUBLISH failed after {} attempt(s): {}", count, error);
                self.fail(&task, outcome, log, message)
            }
        }
    }

    /// Move a `publishing` task to `error` and report the failure.
    fn fail(
        &self,
        task: &PublishTask,
        mut outcome: PublishOutcome,
        log: Vec<PublishAttempt>,
        message: String,
    ) -> Result<PublishOutcome, PublishError> {
        let message = sanitize(&message);
        warn!(task_id = task.id, error = %message, "Publish failed");
        let mut update = TaskUpdate::new()
            .publish_error(Some(message.clone()))
            .error_message(Some(message.clone()))
            .pipeline_status("error")
            .lease(None);
        if !log.is_empty() {
            update = update.publish_attempts(log);
        }
        self.tasks.transition(task.id, TaskStatus::Error, update)?;
        outcome.error = Some(message);
        Ok(outcome)
    }

    fn mark_candidate_used(&self, task: &PublishTask) {
        let Some(candidate_id) = task.candidate_id else {
            return;
        };
        match self.catalog.get_candidate(candidate_id) {
            Ok(Some(mut candidate)) => {
                candidate.status = CandidateStatus::Used;
                if let Err(e) = self.catalog.update_candidate(&candidate) {
                    warn!(task_id = task.id, candidate_id, error = %e, "Failed to mark candidate used");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(task_id = task.id, candidate_id, error = %e, "Failed to load candidate"),
        }
    }
}
