//! Publish history of a destination: quota usage and topic guard state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::window::hours_before;
use super::ScheduleError;
use crate::catalog::{Candidate, CatalogStore, PublishSettings};
use crate::selector::{RankInput, SelectionState};
use crate::task::{PublishTask, TaskFilter, TaskOrder, TaskStatus, TaskStore};
use crate::topic::ensure_topic;

/// Topic guard view of a destination's recent publishes.
#[derive(Debug, Clone, Default)]
pub(crate) struct TopicHistory {
    pub state: SelectionState,
    /// Signatures that may not be published again on this destination yet.
    pub banned: HashSet<String>,
}

fn published(project_id: i64, destination_id: i64) -> TaskFilter {
    TaskFilter::new()
        .with_status(TaskStatus::Published)
        .with_project(project_id)
        .with_destination(destination_id)
}

/// Topic history from the last `topic_guard_last_n` publishes inside the
/// cooldown. Empty when the guard is disabled.
pub(crate) fn topic_history(
    tasks: &dyn TaskStore,
    catalog: &dyn CatalogStore,
    project_id: i64,
    destination_id: i64,
    settings: &PublishSettings,
    now: DateTime<Utc>,
) -> Result<TopicHistory, ScheduleError> {
    if !settings.topic_guard_enabled || settings.topic_guard_last_n == 0 {
        return Ok(TopicHistory::default());
    }

    let filter = published(project_id, destination_id)
        .with_published_since(hours_before(now, settings.topic_guard_cooldown_hours))
        .with_order(TaskOrder::PublishedDesc)
        .with_limit(settings.topic_guard_last_n as i64);
    let ids: Vec<i64> = tasks.list(&filter)?.iter().map(|t| t.id).collect();
    if ids.is_empty() {
        return Ok(TopicHistory::default());
    }

    let mut by_task = catalog.candidates_for_tasks(&ids)?;
    let history: Vec<Candidate> = ids
        .iter()
        .filter_map(|id| by_task.remove(id))
        .map(|mut candidate| {
            ensure_topic(&mut candidate);
            candidate
        })
        .collect();

    let mut state = SelectionState::from_history(&history);
    // "Last" means the most recent publish; it has no candidate to compare.
    if history.first().and_then(|c| c.linked_task_id) != Some(ids[0]) {
        state.last_topic_signature.clear();
        state.last_author_key.clear();
    }
    let banned = state.recent_topic_signatures.clone();
    Ok(TopicHistory { state, banned })
}

/// Tasks of a destination published in `[since, before)`.
pub(crate) fn published_between(
    tasks: &dyn TaskStore,
    project_id: i64,
    destination_id: i64,
    since: DateTime<Utc>,
    before: Option<DateTime<Utc>>,
) -> Result<i64, ScheduleError> {
    let mut filter = published(project_id, destination_id).with_published_since(since);
    if let Some(before) = before {
        filter = filter.with_published_before(before);
    }
    Ok(tasks.count(&filter)?)
}

/// Time of the most recent publish on a destination.
pub(crate) fn last_published_at(
    tasks: &dyn TaskStore,
    project_id: i64,
    destination_id: i64,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let filter = published(project_id, destination_id)
        .with_order(TaskOrder::PublishedDesc)
        .with_limit(1);
    Ok(tasks
        .list(&filter)?
        .into_iter()
        .next()
        .and_then(|t| t.published_at))
}

/// Whether the pipeline left a publishable video on the task.
pub(crate) fn has_video(task: &PublishTask) -> bool {
    task.artifact_str("final_video").is_some() || task.artifact_str("ready_video").is_some()
}

/// Why an eligible task cannot be scheduled at all, if it cannot.
pub(crate) fn prefilter(task: &PublishTask) -> Option<&'static str> {
    if !has_video(task) {
        Some("no_video")
    } else if task.published_url.is_some() || task.published_external_id.is_some() {
        Some("already_published")
    } else {
        None
    }
}

/// Linked candidates of `tasks`, with topic signatures filled in.
pub(crate) fn linked_candidates(
    catalog: &dyn CatalogStore,
    tasks: &[PublishTask],
) -> Result<HashMap<i64, Candidate>, ScheduleError> {
    let ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
    let mut candidates = catalog.candidates_for_tasks(&ids)?;
    for candidate in candidates.values_mut() {
        ensure_topic(candidate);
    }
    Ok(candidates)
}

/// Rank input for a task, scored and keyed by its linked candidate.
pub(crate) fn task_input(
    task: PublishTask,
    candidate: Option<&Candidate>,
) -> RankInput<PublishTask> {
    RankInput {
        id: task.id,
        base_score: candidate.map(Candidate::base_score).unwrap_or(0.0),
        topic_signature: candidate
            .map(|c| c.topic_signature.clone())
            .unwrap_or_default(),
        author_key: candidate.map(Candidate::author_key).unwrap_or_default(),
        created_at: task.created_at,
        item: task,
    }
}

/// Shortened signature for skip reasons.
pub(crate) fn short_signature(signature: &str) -> String {
    signature.chars().take(12).collect()
}
