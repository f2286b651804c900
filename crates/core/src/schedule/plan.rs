//! Daily publish plan: which task goes into which slot of a day.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::history::{linked_candidates, prefilter, published_between, task_input, topic_history};
use super::window::{compute_slots, day_key, day_windows, local_day_bounds, resolve_timezone};
use super::ScheduleError;
use crate::audit::{AuditEvent, AuditHandle};
use crate::catalog::CatalogStore;
use crate::selector::{round4, Selector};
use crate::task::{
    ControlFlags, PublishTask, TaskFilter, TaskOrder, TaskStatus, TaskStore, TaskUpdate,
};

/// Eligible tasks read per plan.
const PLAN_SCAN_LIMIT: i64 = 60;

/// Priority given to the first slot of each destination.
pub const DEFAULT_BASE_PRIORITY: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSlot {
    /// Local slot time, RFC 3339 with offset.
    pub at: String,
    pub task_id: i64,
    pub candidate_id: Option<i64>,
    pub score: f64,
    pub effective_score: f64,
    pub priority: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSkip {
    pub task_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationPlan {
    pub destination_id: i64,
    pub social_account_id: i64,
    pub platform: String,
    pub already_published_today: i64,
    pub daily_limit: i64,
    pub total_slots: usize,
    pub slots: Vec<PlanSlot>,
    pub skipped: Vec<PlanSkip>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPlan {
    pub project_id: i64,
    pub timezone: String,
    pub date: NaiveDate,
    pub day: String,
    pub windows: Vec<[String; 2]>,
    pub min_gap_minutes: i64,
    pub destinations: Vec<DestinationPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyEntry {
    pub task_id: i64,
    pub priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueue_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    pub date: NaiveDate,
    pub timezone: String,
    pub destinations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub ok: Vec<ApplyEntry>,
    pub failed: Vec<PlanSkip>,
    pub plan_summary: PlanSummary,
}

/// Priority for the slot at `index` of a destination.
pub fn slot_priority(base_priority: i64, index: usize) -> i64 {
    (base_priority - index as i64).clamp(-10, 10)
}

/// Computes and applies daily publish plans.
pub struct DailyPlanner {
    tasks: Arc<dyn TaskStore>,
    catalog: Arc<dyn CatalogStore>,
    selector: Selector,
    base_priority: i64,
    audit: Option<AuditHandle>,
}

impl DailyPlanner {
    pub fn new(tasks: Arc<dyn TaskStore>, catalog: Arc<dyn CatalogStore>, selector: Selector) -> Self {
        Self {
            tasks,
            catalog,
            selector,
            base_priority: DEFAULT_BASE_PRIORITY,
            audit: None,
        }
    }

    pub fn with_base_priority(mut self, base_priority: i64) -> Self {
        self.base_priority = base_priority;
        self
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Plan for `date` (the project's local today when `None`). Read only.
    pub fn compute_daily_plan(
        &self,
        project_id: i64,
        date: Option<NaiveDate>,
    ) -> Result<DailyPlan, ScheduleError> {
        self.compute_daily_plan_at(project_id, date, Utc::now())
    }

    pub fn compute_daily_plan_at(
        &self,
        project_id: i64,
        date: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<DailyPlan, ScheduleError> {
        let project = self
            .catalog
            .get_project(project_id)?
            .ok_or(ScheduleError::ProjectNotFound(project_id))?;
        let settings = &project.publish;
        let (tz, tz_name) = resolve_timezone(&settings.timezone);
        let date = date.unwrap_or_else(|| now.with_timezone(&tz).date_naive());
        let windows = day_windows(settings, date);
        let (day_start, day_end) = local_day_bounds(tz, date);

        let eligible = self.tasks.list(
            &TaskFilter::new()
                .with_status(TaskStatus::ReadyForPublish)
                .with_project(project_id)
                .with_order(TaskOrder::PriorityDesc)
                .with_limit(PLAN_SCAN_LIMIT),
        )?;
        let candidates = linked_candidates(self.catalog.as_ref(), &eligible)?;

        let mut destinations = Vec::new();
        for destination in self.catalog.destinations(project_id)? {
            if !destination.active {
                continue;
            }
            let already_published = published_between(
                self.tasks.as_ref(),
                project_id,
                destination.id,
                day_start,
                Some(day_end),
            )?;
            let slots = compute_slots(
                &windows,
                settings.min_gap_minutes_per_destination,
                settings.daily_limit_per_destination,
                already_published,
                tz,
                date,
            );
            let history = topic_history(
                self.tasks.as_ref(),
                self.catalog.as_ref(),
                project_id,
                destination.id,
                settings,
                now,
            )?;

            let mut skipped = Vec::new();
            let mut inputs = Vec::new();
            for task in eligible.iter().filter(|t| t.destination_id == destination.id) {
                if let Some(reason) = prefilter(task) {
                    skipped.push(PlanSkip {
                        task_id: task.id,
                        reason: reason.to_string(),
                    });
                    continue;
                }
                inputs.push(task_input(task.clone(), candidates.get(&task.id)));
            }
            let ranked = self.selector.rank(inputs, &history.state);

            // Greedy: each slot takes the best unused task whose topic is not blocked.
            let mut banned = history.banned;
            let mut used: HashSet<i64> = HashSet::new();
            let mut assigned = Vec::new();
            for slot in &slots {
                let mut pick = None;
                for scored in &ranked {
                    if used.contains(&scored.id) {
                        continue;
                    }
                    let signature = &scored.topic_signature;
                    if settings.topic_guard_enabled
                        && !signature.is_empty()
                        && banned.contains(signature)
                    {
                        if !skipped.iter().any(|s: &PlanSkip| s.task_id == scored.id) {
                            skipped.push(PlanSkip {
                                task_id: scored.id,
                                reason: "topic_repeat".to_string(),
                            });
                        }
                        continue;
                    }
                    pick = Some(scored);
                    break;
                }
                let Some(scored) = pick else {
                    continue;
                };
                if !scored.topic_signature.is_empty() {
                    banned.insert(scored.topic_signature.clone());
                }
                used.insert(scored.id);
                assigned.push(PlanSlot {
                    at: slot.to_rfc3339(),
                    task_id: scored.id,
                    candidate_id: candidates.get(&scored.id).map(|c| c.id),
                    score: round4(scored.base_score),
                    effective_score: round4(scored.effective_score),
                    priority: scored.item.priority,
                    reason: "ranked".to_string(),
                });
            }

            destinations.push(DestinationPlan {
                destination_id: destination.id,
                social_account_id: destination.social_account_id,
                platform: destination.platform.clone(),
                already_published_today: already_published,
                daily_limit: settings.daily_limit_per_destination,
                total_slots: slots.len(),
                slots: assigned,
                skipped,
            });
        }

        Ok(DailyPlan {
            project_id,
            timezone: tz_name,
            date,
            day: day_key(date).to_string(),
            windows,
            min_gap_minutes: settings.min_gap_minutes_per_destination,
            destinations,
        })
    }

    /// Compute the plan for `date` and write slot priorities onto its tasks.
    ///
    /// With `enqueue`, planned tasks whose state has an edge to `queued` are
    /// also put back in the queue.
    pub async fn apply_daily_plan(
        &self,
        project_id: i64,
        date: Option<NaiveDate>,
        enqueue: bool,
    ) -> Result<ApplyReport, ScheduleError> {
        let plan = self.compute_daily_plan(project_id, date)?;

        let mut ok = Vec::new();
        let mut failed = Vec::new();
        for destination in &plan.destinations {
            for (index, slot) in destination.slots.iter().enumerate() {
                let priority = slot_priority(self.base_priority, index);
                let Some(task) = self.tasks.get(slot.task_id)? else {
                    failed.push(PlanSkip {
                        task_id: slot.task_id,
                        reason: "not_found".to_string(),
                    });
                    continue;
                };
                let task = self.tasks.update(task.id, TaskUpdate::new().priority(priority))?;
                let mut entry = ApplyEntry {
                    task_id: task.id,
                    priority,
                    enqueued: None,
                    enqueue_error: None,
                };
                if enqueue && task.status.can_transition_to(TaskStatus::Queued) {
                    self.enqueue(&task, &mut entry);
                }
                ok.push(entry);
            }
            failed.extend(destination.skipped.iter().cloned());
        }

        info!(
            project_id,
            date = %plan.date,
            ok = ok.len(),
            failed = failed.len(),
            enqueue,
            "Applied daily publish plan"
        );
        if let Some(ref audit) = self.audit {
            audit
                .emit(AuditEvent::DailyPublishPlanApply {
                    project_id,
                    date: plan.date.to_string(),
                    base_priority: self.base_priority,
                    enqueue,
                    ok_count: ok.len(),
                    failed_count: failed.len(),
                    task_ids: ok.iter().map(|e| e.task_id).collect(),
                })
                .await;
        }

        Ok(ApplyReport {
            ok,
            failed,
            plan_summary: PlanSummary {
                date: plan.date,
                timezone: plan.timezone,
                destinations: plan.destinations.len(),
            },
        })
    }

    fn enqueue(&self, task: &PublishTask, entry: &mut ApplyEntry) {
        let update = TaskUpdate::new()
            .control(ControlFlags::default())
            .lease(None);
        match self.tasks.transition(task.id, TaskStatus::Queued, update) {
            Ok(_) => entry.enqueued = Some(true),
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Failed to enqueue planned task");
                entry.enqueued = Some(false);
                entry.enqueue_error = Some(e.to_string());
            }
        }
    }
}
