//! Scheduled publish pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::history::{
    last_published_at, linked_candidates, prefilter, published_between, short_signature,
    task_input, topic_history, TopicHistory,
};
use super::window::{in_window, local_day_bounds, resolve_timezone};
use super::{PublishRunReport, PublishStarted, ScheduleError, ELIGIBLE_LIMIT, PUBLISH_TOOL_ID};
use crate::audit::{AuditEvent, AuditHandle};
use crate::catalog::{CatalogStore, Project};
use crate::processor::ProcessorConfig;
use crate::publisher::PublishService;
use crate::selector::{rank_order, RankInput, SelectionState, Selector};
use crate::sleeper::Sleeper;
use crate::task::{
    NewStepResult, PublishTask, StepCompletion, StepResultStatus, TaskFilter, TaskOrder,
    TaskStatus, TaskStore,
};

/// Quota and topic state of one destination during a pass.
struct DestinationGate {
    published_today: i64,
    last_published: Option<DateTime<Utc>>,
    topics: TopicHistory,
}

/// Publishes `ready_for_publish` tasks inside the project publish windows.
pub struct ScheduledPublisher {
    tasks: Arc<dyn TaskStore>,
    catalog: Arc<dyn CatalogStore>,
    publisher: Arc<PublishService>,
    sleeper: Arc<dyn Sleeper>,
    selector: Selector,
    pipeline: ProcessorConfig,
    audit: Option<AuditHandle>,
}

impl ScheduledPublisher {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        catalog: Arc<dyn CatalogStore>,
        publisher: Arc<PublishService>,
        sleeper: Arc<dyn Sleeper>,
        selector: Selector,
        pipeline: ProcessorConfig,
    ) -> Self {
        Self {
            tasks,
            catalog,
            publisher,
            sleeper,
            selector,
            pipeline,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    /// One pass over every project with publishing enabled.
    pub async fn run_publish(&self, dry_run: bool) -> Result<PublishRunReport, ScheduleError> {
        self.run_publish_at(Utc::now(), dry_run).await
    }

    /// [`run_publish`](Self::run_publish) as if the current time were `now`.
    pub async fn run_publish_at(
        &self,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<PublishRunReport, ScheduleError> {
        let mut report = PublishRunReport::new(now, dry_run);

        for project in self.catalog.list_projects()? {
            if !project.publish.publish_enabled {
                continue;
            }
            let started_before = report.started.len();
            if let Err(e) = self.publish_project(&project, now, dry_run, &mut report).await {
                warn!(project_id = project.id, error = %e, "Scheduled publish failed for project");
                report.skip(project.id, None, format!("error: {}", e));
            }
            if !dry_run {
                self.audit_project(project.id, &report.started[started_before..])
                    .await;
            }
            if report.interrupted {
                break;
            }
        }

        let report = report.finish();
        if report.started_count > 0 || report.interrupted {
            info!(
                started = report.started_count,
                skipped = report.skipped_count,
                dry_run,
                interrupted = report.interrupted,
                "Scheduled publish pass"
            );
        }
        Ok(report)
    }

    fn eligible_filter(project_id: i64) -> TaskFilter {
        TaskFilter::new()
            .with_status(TaskStatus::ReadyForPublish)
            .with_project(project_id)
    }

    fn destination_gates(
        &self,
        project: &Project,
        now: DateTime<Utc>,
    ) -> Result<HashMap<i64, DestinationGate>, ScheduleError> {
        let settings = &project.publish;
        let (tz, _) = resolve_timezone(&settings.timezone);
        let (day_start, _) = local_day_bounds(tz, now.with_timezone(&tz).date_naive());

        let mut gates = HashMap::new();
        for destination in self.catalog.destinations(project.id)? {
            if !destination.active {
                continue;
            }
            let gate = DestinationGate {
                published_today: published_between(
                    self.tasks.as_ref(),
                    project.id,
                    destination.id,
                    day_start,
                    None,
                )?,
                last_published: last_published_at(self.tasks.as_ref(), project.id, destination.id)?,
                topics: topic_history(
                    self.tasks.as_ref(),
                    self.catalog.as_ref(),
                    project.id,
                    destination.id,
                    settings,
                    now,
                )?,
            };
            gates.insert(destination.id, gate);
        }
        Ok(gates)
    }

    async fn publish_project(
        &self,
        project: &Project,
        now: DateTime<Utc>,
        dry_run: bool,
        report: &mut PublishRunReport,
    ) -> Result<(), ScheduleError> {
        let settings = &project.publish;

        if !in_window(settings, now) {
            let count = self.tasks.count(&Self::eligible_filter(project.id))?;
            if count > 0 {
                report.skipped.push(super::PublishSkipped {
                    project_id: project.id,
                    task_id: None,
                    reason: "not_in_window".to_string(),
                    count: Some(count),
                });
            }
            return Ok(());
        }

        let mut gates = self.destination_gates(project, now)?;

        let eligible = self.tasks.list(
            &Self::eligible_filter(project.id)
                .with_order(TaskOrder::CreatedAsc)
                .with_limit(ELIGIBLE_LIMIT),
        )?;
        let candidates = linked_candidates(self.catalog.as_ref(), &eligible)?;

        let mut groups: BTreeMap<i64, Vec<RankInput<PublishTask>>> = BTreeMap::new();
        for task in eligible {
            if let Some(reason) = prefilter(&task) {
                report.skip(project.id, Some(task.id), reason);
                continue;
            }
            let destination_id = task.destination_id;
            let candidate = candidates.get(&task.id);
            groups
                .entry(destination_id)
                .or_default()
                .push(task_input(task, candidate));
        }

        // Each destination ranks against its own history.
        let no_history = SelectionState::default();
        let mut ranked = Vec::new();
        for (destination_id, inputs) in groups {
            let state = gates
                .get(&destination_id)
                .map(|g| &g.topics.state)
                .unwrap_or(&no_history);
            ranked.extend(self.selector.rank(inputs, state));
        }
        ranked.sort_by(rank_order);
        report.ranking.push(super::ProjectRanking {
            project_id: project.id,
            top: self.selector.top_debug(&ranked),
        });

        let daily_limit = settings.daily_limit_per_destination;
        let min_gap = settings.min_gap_minutes_per_destination;

        for scored in ranked {
            let task = scored.item;
            let Some(gate) = gates.get_mut(&task.destination_id) else {
                report.skip(project.id, Some(task.id), "destination_inactive");
                continue;
            };

            if gate.published_today >= daily_limit {
                report.skip(
                    project.id,
                    Some(task.id),
                    format!("daily_limit: {}/{}", gate.published_today, daily_limit),
                );
                continue;
            }

            if let Some(last) = gate.last_published {
                let gap = (now - last).num_seconds() as f64 / 60.0;
                if min_gap > 0 && gap < min_gap as f64 {
                    report.skip(
                        project.id,
                        Some(task.id),
                        format!("min_gap: {:.0}m < {}m", gap, min_gap),
                    );
                    continue;
                }
            }

            if settings.topic_guard_enabled
                && !scored.topic_signature.is_empty()
                && gate.topics.banned.contains(&scored.topic_signature)
            {
                report.skip(
                    project.id,
                    Some(task.id),
                    format!("topic_repeat: sig={}…", short_signature(&scored.topic_signature)),
                );
                continue;
            }

            let score = candidates.get(&task.id).and_then(|c| c.score);
            let mut started = PublishStarted {
                project_id: project.id,
                task_id: task.id,
                destination_id: task.destination_id,
                score,
                effective_score: scored.effective_score,
                dry_run,
                success: None,
                published_url: None,
                error: None,
            };

            if dry_run {
                report.started.push(started);
                gate.published_today += 1;
                gate.last_published = Some(now);
                continue;
            }

            if settings.jitter_minutes > 0 {
                let jitter_secs = rand::thread_rng().gen_range(0..=(settings.jitter_minutes as u64).saturating_mul(60));
                info!(task_id = task.id, jitter_secs, "Waiting before publish");
                if self
                    .sleeper
                    .sleep(StdDuration::from_secs(jitter_secs))
                    .await
                    .is_err()
                {
                    info!(task_id = task.id, "Shutdown during publish jitter, stopping pass");
                    report.interrupted = true;
                    return Ok(());
                }
            }

            let (success, output, error) = self.publish(&task).await;
            started.success = Some(success);
            started.published_url = output
                .get("published_url")
                .and_then(Value::as_str)
                .map(String::from);
            started.error = error.clone();
            self.record_step(&task, now, success, output, error);
            report.started.push(started);

            gate.published_today += 1;
            gate.last_published = Some(now);
        }
        Ok(())
    }

    /// Publish one task. Returns `(success, serialized outcome, error)`.
    async fn publish(&self, task: &PublishTask) -> (bool, Value, Option<String>) {
        let work_dir = self.pipeline.task_dir(task.id);
        match self.publisher.publish_task(task.id, &work_dir).await {
            Ok(outcome) => {
                let error = if outcome.published {
                    None
                } else {
                    outcome
                        .error
                        .clone()
                        .or_else(|| outcome.skipped_reason.clone())
                };
                let output = serde_json::to_value(&outcome).unwrap_or(Value::Null);
                (outcome.published, output, error)
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Scheduled publish failed");
                (false, json!({}), Some(e.to_string()))
            }
        }
    }

    /// Record the publish attempt as a step result. A repeated publish
    /// versions the earlier publish step; a pending retry of it is filled in.
    fn record_step(
        &self,
        task: &PublishTask,
        started_at: DateTime<Utc>,
        success: bool,
        output: Value,
        error: Option<String>,
    ) {
        let status = if success {
            StepResultStatus::Completed
        } else {
            StepResultStatus::Error
        };
        let previous = match self.tasks.step_results(task.id) {
            Ok(results) => results
                .into_iter()
                .filter(|r| r.tool_id == PUBLISH_TOOL_ID)
                .max_by_key(|r| (r.step_index, r.version)),
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Cannot read step results, publish step not recorded");
                return;
            }
        };

        if let Some(pending) = previous
            .as_ref()
            .filter(|r| r.status == StepResultStatus::Pending)
        {
            let completion = StepCompletion {
                status,
                output_data: output,
                error_message: error,
                started_at: Some(started_at),
                completed_at: Some(Utc::now()),
            };
            match self.tasks.complete_step_result(pending.id, completion) {
                Ok(_) => debug!(task_id = task.id, step_index = pending.step_index, success, "Completed retried publish step"),
                Err(e) => warn!(task_id = task.id, error = %e, "Failed to record publish step"),
            }
            return;
        }

        let mut step = match previous {
            Some(ref prev) => NewStepResult::retry_of(prev, status),
            None => {
                let index = match self.tasks.max_step_index(task.id) {
                    Ok(max) => max.map_or(0, |m| m + 1),
                    Err(e) => {
                        warn!(task_id = task.id, error = %e, "Cannot read step indices, publish step not recorded");
                        return;
                    }
                };
                NewStepResult::new(task.id, index, PUBLISH_TOOL_ID, "Publish (auto)", status)
            }
        };
        let index = step.step_index;
        step.moderation_status = "auto".to_string();
        step.can_retry = true;
        step.output_data = output;
        step.error_message = error;
        step.started_at = Some(started_at);
        step.completed_at = Some(Utc::now());

        if let Err(e) = self.tasks.insert_step_result(step) {
            warn!(task_id = task.id, error = %e, "Failed to record publish step");
        } else {
            debug!(task_id = task.id, step_index = index, success, "Recorded publish step");
        }
    }

    async fn audit_project(&self, project_id: i64, started: &[PublishStarted]) {
        let Some(ref audit) = self.audit else {
            return;
        };
        if started.is_empty() {
            return;
        }
        let success_count = started.iter().filter(|s| s.success == Some(true)).count();
        audit
            .emit(AuditEvent::AutoPublish {
                project_id,
                task_ids: started.iter().map(|s| s.task_id).collect(),
                success_count,
                failed_count: started.len() - success_count,
            })
            .await;
    }
}
