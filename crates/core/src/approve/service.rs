use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::dedup::{CatalogDuplicateDetector, DuplicateDetector};
use super::{
    ApproveError, ApproveReport, ApproveRunReport, ApproveSkip, ApprovedItem, DailyUsage,
    ProjectFailure, DEFAULT_THRESHOLD, MAX_CANDIDATES_PER_RUN,
};
use crate::audit::{AuditEvent, AuditHandle};
use crate::catalog::{
    Candidate, CandidateFilter, CandidateOrigin, CandidateStatus, CatalogStore, Destination,
    Project,
};
use crate::metrics;
use crate::schedule::{hours_before, local_day_bounds, resolve_timezone};
use crate::selector::{candidate_input, round4, SelectionState, Selector};
use crate::task::{CreateTaskRequest, TaskFilter, TaskStore};
use crate::topic::ensure_topic;

const HISTORY_LIMIT: i64 = 10_000;

/// Running diversity and budget counters of one project pass.
#[derive(Default)]
struct Gates {
    cooldown_keys: HashSet<String>,
    author_today: HashMap<String, i64>,
    topic_today: HashMap<String, i64>,
    topic_run: HashMap<String, i64>,
    daily_counts: HashMap<i64, i64>,
}

impl Gates {
    fn record(&mut self, candidate: &Candidate, destination_id: i64, diversity: bool) {
        *self.daily_counts.entry(destination_id).or_insert(0) += 1;
        if let Some(key) = candidate.cooldown_key() {
            self.cooldown_keys.insert(key);
        }
        if !diversity {
            return;
        }
        if let Some(author) = diversity_author(candidate) {
            *self.author_today.entry(author).or_insert(0) += 1;
        }
        if !candidate.topic_signature.is_empty() {
            let sig = candidate.topic_signature.clone();
            *self.topic_today.entry(sig.clone()).or_insert(0) += 1;
            *self.topic_run.entry(sig).or_insert(0) += 1;
        }
    }
}

/// Author key counted against the daily author cap. Generated content has none.
fn diversity_author(candidate: &Candidate) -> Option<String> {
    match candidate.origin {
        CandidateOrigin::Generate => None,
        CandidateOrigin::Repurpose => Some(candidate.author_key()).filter(|k| !k.is_empty()),
    }
}

fn short(signature: &str) -> String {
    signature.chars().take(12).collect()
}

/// Project threshold: operator override, then calibration, then the default.
pub fn approve_threshold(project: &Project) -> f64 {
    project
        .feed
        .min_score_override
        .or(project.calibration_threshold)
        .unwrap_or(DEFAULT_THRESHOLD)
}

/// Approves candidates and creates their tasks.
pub struct AutoApprover {
    tasks: Arc<dyn TaskStore>,
    catalog: Arc<dyn CatalogStore>,
    detector: Arc<dyn DuplicateDetector>,
    selector: Selector,
    audit: Option<AuditHandle>,
}

impl AutoApprover {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        catalog: Arc<dyn CatalogStore>,
        selector: Selector,
    ) -> Self {
        let detector = Arc::new(CatalogDuplicateDetector::new(catalog.clone()));
        Self {
            tasks,
            catalog,
            detector,
            selector,
            audit: None,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn DuplicateDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    /// One pass over every project with auto-approve enabled.
    pub async fn run_auto_approve(
        &self,
        dry_run: bool,
    ) -> Result<ApproveRunReport, ApproveError> {
        let now = Utc::now();
        let mut run = ApproveRunReport {
            processed: 0,
            total_approved: 0,
            projects: Vec::new(),
            failures: Vec::new(),
            dry_run,
            run_at: now,
        };

        for project in self.catalog.list_projects()? {
            if !project.feed.auto_approve_enabled {
                continue;
            }
            run.processed += 1;
            match self.approve_project(&project, now, dry_run).await {
                Ok(report) => {
                    run.total_approved += report.approved_count;
                    run.projects.push(report);
                }
                Err(e) => {
                    warn!(project_id = project.id, error = %e, "Auto-approve failed for project");
                    run.failures.push(ProjectFailure {
                        project_id: project.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if run.total_approved > 0 {
            info!(
                projects = run.processed,
                approved = run.total_approved,
                dry_run,
                "Auto-approve pass"
            );
        }
        Ok(run)
    }

    /// Auto-approve a single project, regardless of its enabled flag.
    pub async fn run_project(
        &self,
        project_id: i64,
        dry_run: bool,
    ) -> Result<ApproveReport, ApproveError> {
        self.run_project_at(project_id, Utc::now(), dry_run).await
    }

    pub async fn run_project_at(
        &self,
        project_id: i64,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<ApproveReport, ApproveError> {
        let project = self
            .catalog
            .get_project(project_id)?
            .ok_or(ApproveError::ProjectNotFound(project_id))?;
        self.approve_project(&project, now, dry_run).await
    }

    async fn approve_project(
        &self,
        project: &Project,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<ApproveReport, ApproveError> {
        let feed = &project.feed;
        let threshold = approve_threshold(project);
        let mut report = ApproveReport::new(project.id, round4(threshold), now, dry_run);

        let destinations: Vec<Destination> = self
            .catalog
            .destinations(project.id)?
            .into_iter()
            .filter(|d| d.active)
            .collect();
        if destinations.is_empty() {
            report.error = Some("no active destinations".to_string());
            return Ok(report.finish());
        }

        let (tz, _) = resolve_timezone(&project.publish.timezone);
        let (day_start, _) = local_day_bounds(tz, now.with_timezone(&tz).date_naive());

        let mut gates = Gates::default();
        for destination in &destinations {
            let used = self.tasks.count(
                &TaskFilter::new()
                    .with_project(project.id)
                    .with_destination(destination.id)
                    .with_created_since(day_start),
            )?;
            gates.daily_counts.insert(destination.id, used);
        }

        let cooldown_cutoff = hours_before(now, feed.cooldown_hours_per_source);
        for candidate in self.approved_since(project.id, cooldown_cutoff)? {
            if let Some(key) = candidate.cooldown_key() {
                gates.cooldown_keys.insert(key);
            }
        }

        let mut state = SelectionState::default();
        if feed.diversity_enabled {
            let mut today = self.approved_since(project.id, day_start)?;
            today.sort_by(|a, b| b.reviewed_at.cmp(&a.reviewed_at));
            for candidate in today.iter_mut() {
                ensure_topic(candidate);
                if let Some(author) = diversity_author(candidate) {
                    *gates.author_today.entry(author).or_insert(0) += 1;
                }
                if !candidate.topic_signature.is_empty() {
                    *gates
                        .topic_today
                        .entry(candidate.topic_signature.clone())
                        .or_insert(0) += 1;
                }
            }
            state = SelectionState::from_history(&today);
        }

        let filter = CandidateFilter::new()
            .with_project(project.id)
            .with_status(CandidateStatus::New)
            .with_min_score(threshold)
            .unlinked()
            .with_limit(MAX_CANDIDATES_PER_RUN);
        let inputs = self
            .catalog
            .list_candidates(&filter)?
            .into_iter()
            .filter(|c| feed.origin_filter.accepts(c.origin))
            .map(|mut candidate| {
                ensure_topic(&mut candidate);
                candidate_input(&candidate)
            })
            .collect();
        let ranked = self.selector.rank(inputs, &state);
        report.ranking_debug = self.selector.top_debug(&ranked);

        let mut approved_tasks = Vec::new();
        for scored in ranked {
            let candidate = scored.item;
            if let Some(reason) = self.gate(project, &candidate, &gates)? {
                report.skipped.push(ApproveSkip {
                    candidate_id: candidate.id,
                    score: candidate.score,
                    reason,
                });
                continue;
            }

            let Some(destination) = destinations.iter().find(|d| {
                gates.daily_counts.get(&d.id).copied().unwrap_or(0)
                    < feed.daily_limit_per_destination
            }) else {
                report.skipped.push(ApproveSkip {
                    candidate_id: candidate.id,
                    score: candidate.score,
                    reason: "daily_limit: all destinations exhausted".to_string(),
                });
                continue;
            };

            let task_id = if dry_run {
                None
            } else {
                match self.approve(project, &candidate, destination, now) {
                    Ok(task_id) => Some(task_id),
                    Err(e) => {
                        warn!(candidate_id = candidate.id, error = %e, "Failed to approve candidate");
                        report.skipped.push(ApproveSkip {
                            candidate_id: candidate.id,
                            score: candidate.score,
                            reason: format!("error: {}", e),
                        });
                        continue;
                    }
                }
            };

            gates.record(&candidate, destination.id, feed.diversity_enabled);
            if let Some(task_id) = task_id {
                approved_tasks.push(task_id);
            }
            report.approved.push(ApprovedItem {
                candidate_id: candidate.id,
                task_id,
                destination_id: destination.id,
                destination_platform: destination.platform.clone(),
                score: candidate.score,
                title: candidate.title.clone(),
                dry_run,
            });
        }

        for destination in &destinations {
            report.daily_limits.insert(
                destination.id,
                DailyUsage {
                    platform: destination.platform.clone(),
                    used: gates.daily_counts.get(&destination.id).copied().unwrap_or(0),
                    limit: feed.daily_limit_per_destination,
                },
            );
        }

        let report = report.finish();
        if !dry_run && report.approved_count > 0 {
            metrics::TASKS_APPROVED_TOTAL.inc_by(report.approved_count as u64);
            if let Some(ref audit) = self.audit {
                audit
                    .emit(AuditEvent::AutoApprove {
                        project_id: project.id,
                        threshold: report.threshold,
                        approved_count: report.approved_count,
                        skipped_count: report.skipped_count,
                        candidate_ids: report.approved.iter().map(|a| a.candidate_id).collect(),
                        task_ids: approved_tasks,
                    })
                    .await;
            }
        }

        info!(
            project_id = project.id,
            approved = report.approved_count,
            skipped = report.skipped_count,
            threshold = report.threshold,
            dry_run,
            "Auto-approve"
        );
        Ok(report)
    }

    fn approved_since(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, ApproveError> {
        let filter = CandidateFilter::new()
            .with_project(project_id)
            .with_status(CandidateStatus::Approved)
            .with_status(CandidateStatus::Used)
            .with_reviewed_since(since)
            .with_limit(HISTORY_LIMIT);
        Ok(self.catalog.list_candidates(&filter)?)
    }

    /// First gate that rejects the candidate, checked in a fixed order.
    fn gate(
        &self,
        project: &Project,
        candidate: &Candidate,
        gates: &Gates,
    ) -> Result<Option<String>, ApproveError> {
        let feed = &project.feed;

        if let Some(dup) = self.detector.find_duplicate(candidate)? {
            return Ok(Some(format!(
                "duplicate: same content as #{} (status={})",
                dup.id,
                dup.status.as_str()
            )));
        }

        if let Some((dup, distance)) = self
            .detector
            .find_near_duplicate(candidate, feed.simhash_max_distance)?
        {
            return Ok(Some(format!("near_duplicate: #{} d={}", dup.id, distance)));
        }

        if let Some(key) = candidate.cooldown_key() {
            if gates.cooldown_keys.contains(&key) {
                return Ok(Some(format!(
                    "cooldown: '{}' approved within {}h",
                    key, feed.cooldown_hours_per_source
                )));
            }
        }

        if !feed.diversity_enabled {
            return Ok(None);
        }

        if let Some(author) = diversity_author(candidate) {
            let count = gates.author_today.get(&author).copied().unwrap_or(0);
            if count >= feed.max_per_author_per_day {
                return Ok(Some(format!(
                    "author_cap: '{}' {}/{}",
                    author, count, feed.max_per_author_per_day
                )));
            }
        }

        let sig = &candidate.topic_signature;
        if !sig.is_empty() {
            let today = gates.topic_today.get(sig).copied().unwrap_or(0);
            if today >= feed.max_per_topic_per_day {
                return Ok(Some(format!(
                    "topic_cap: sig={}… {}/{}",
                    short(sig),
                    today,
                    feed.max_per_topic_per_day
                )));
            }
            let run = gates.topic_run.get(sig).copied().unwrap_or(0);
            if run >= feed.max_same_topic_in_single_run {
                return Ok(Some(format!(
                    "topic_run_cap: sig={}… {}/{}",
                    short(sig),
                    run,
                    feed.max_same_topic_in_single_run
                )));
            }
        }

        Ok(None)
    }

    /// Create the candidate's task on `destination` and link it back.
    fn approve(
        &self,
        project: &Project,
        candidate: &Candidate,
        destination: &Destination,
        now: DateTime<Utc>,
    ) -> Result<i64, ApproveError> {
        let repurposed = candidate.origin == CandidateOrigin::Repurpose;
        let mut artifacts = Map::new();
        if let (CandidateOrigin::Generate, Some(brief_id)) = (candidate.origin, candidate.brief_id) {
            artifacts.insert("origin".to_string(), Value::from("GENERATE"));
            artifacts.insert("brief_id".to_string(), Value::from(brief_id));
        }

        let task = self.tasks.create(CreateTaskRequest {
            project_id: project.id,
            platform: destination.platform.clone(),
            destination_id: destination.id,
            candidate_id: Some(candidate.id),
            caption_text: candidate.caption.clone().or_else(|| candidate.title.clone()),
            download_url: candidate.url.clone().filter(|_| repurposed),
            permalink: candidate.url.clone().filter(|_| repurposed),
            artifacts,
            ..Default::default()
        })?;

        let mut linked = candidate.clone();
        linked.status = CandidateStatus::Approved;
        linked.linked_task_id = Some(task.id);
        linked.reviewed_at = Some(now);
        self.catalog.update_candidate(&linked)?;
        Ok(task.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEventEnvelope;
    use crate::catalog::{FeedSettings, OriginFilter, SqliteCatalog};
    use crate::task::{SqliteTaskStore, TaskStatus};
    use crate::testing::fixtures;
    use chrono::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        tasks: Arc<SqliteTaskStore>,
        catalog: Arc<SqliteCatalog>,
        project: Project,
        destination: Destination,
    }

    fn harness(feed: FeedSettings) -> Harness {
        let tasks = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let catalog = Arc::new(SqliteCatalog::in_memory().unwrap());
        let mut project = Project::new("p");
        project.feed = feed;
        let project = catalog.create_project(project).unwrap();
        let destination = catalog
            .create_destination(fixtures::destination(project.id, "youtube"))
            .unwrap();
        Harness {
            tasks,
            catalog,
            project,
            destination,
        }
    }

    fn enabled() -> FeedSettings {
        FeedSettings {
            auto_approve_enabled: true,
            ..Default::default()
        }
    }

    impl Harness {
        fn approver(&self) -> AutoApprover {
            AutoApprover::new(self.tasks.clone(), self.catalog.clone(), Selector::default())
        }

        fn add(&self, score: f64, author: &str, tags: &[&str]) -> Candidate {
            self.catalog
                .create_candidate(fixtures::candidate(self.project.id, score, author, tags))
                .unwrap()
        }

        fn add_approved(
            &self,
            author: &str,
            tags: &[&str],
            reviewed_at: DateTime<Utc>,
        ) -> Candidate {
            let mut candidate = fixtures::candidate(self.project.id, 0.9, author, tags);
            candidate.status = CandidateStatus::Approved;
            candidate.reviewed_at = Some(reviewed_at);
            self.catalog.create_candidate(candidate).unwrap()
        }

        fn reasons(report: &ApproveReport) -> Vec<String> {
            report.skipped.iter().map(|s| s.reason.clone()).collect()
        }
    }

    #[test]
    fn test_threshold_precedence() {
        let mut project = Project::new("p");
        assert_eq!(approve_threshold(&project), 0.70);
        project.calibration_threshold = Some(0.8);
        assert_eq!(approve_threshold(&project), 0.8);
        project.feed.min_score_override = Some(0.5);
        assert_eq!(approve_threshold(&project), 0.5);
    }

    #[tokio::test]
    async fn test_approves_and_links_candidates() {
        let h = harness(enabled());
        let best = h.add(0.95, "alice", &["food"]);
        let second = h.add(0.85, "bob", &["travel"]);
        let low = h.add(0.40, "carol", &["music"]);
        let (tx, mut rx) = mpsc::channel::<AuditEventEnvelope>(8);

        let report = h
            .approver()
            .with_audit(AuditHandle::new(tx))
            .run_project(h.project.id, false)
            .await
            .unwrap();

        assert_eq!(report.approved_count, 2);
        assert_eq!(report.approved[0].candidate_id, best.id);
        assert_eq!(report.approved[1].candidate_id, second.id);
        assert_eq!(report.threshold, 0.7);

        let task_id = report.approved[0].task_id.unwrap();
        let task = h.tasks.get(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.destination_id, h.destination.id);
        assert_eq!(task.candidate_id, Some(best.id));
        assert_eq!(task.download_url, best.url);

        let linked = h.catalog.get_candidate(best.id).unwrap().unwrap();
        assert_eq!(linked.status, CandidateStatus::Approved);
        assert_eq!(linked.linked_task_id, Some(task_id));
        assert!(linked.reviewed_at.is_some());

        let untouched = h.catalog.get_candidate(low.id).unwrap().unwrap();
        assert_eq!(untouched.status, CandidateStatus::New);

        assert_eq!(report.daily_limits[&h.destination.id].used, 2);
        assert_eq!(rx.try_recv().unwrap().event.event_type(), "auto_approve");
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let h = harness(enabled());
        let candidate = h.add(0.9, "alice", &["food"]);

        let report = h.approver().run_project(h.project.id, true).await.unwrap();
        assert_eq!(report.approved_count, 1);
        assert!(report.approved[0].dry_run);
        assert!(report.approved[0].task_id.is_none());
        assert_eq!(h.tasks.count(&TaskFilter::new()).unwrap(), 0);
        assert_eq!(
            h.catalog.get_candidate(candidate.id).unwrap().unwrap().status,
            CandidateStatus::New
        );
    }

    #[tokio::test]
    async fn test_daily_limit_exhausts_destinations() {
        let mut feed = enabled();
        feed.daily_limit_per_destination = 1;
        let h = harness(feed);
        h.add(0.9, "alice", &["food"]);
        h.add(0.8, "bob", &["travel"]);

        let report = h.approver().run_project(h.project.id, false).await.unwrap();
        assert_eq!(report.approved_count, 1);
        assert_eq!(
            Harness::reasons(&report),
            vec!["daily_limit: all destinations exhausted".to_string()]
        );
        assert_eq!(report.skipped_reasons_breakdown["daily_limit"], 1);
    }

    #[tokio::test]
    async fn test_second_destination_takes_overflow() {
        let mut feed = enabled();
        feed.daily_limit_per_destination = 1;
        let h = harness(feed);
        let second = h
            .catalog
            .create_destination(fixtures::destination(h.project.id, "tiktok"))
            .unwrap();
        h.add(0.9, "alice", &["food"]);
        h.add(0.8, "bob", &["travel"]);

        let report = h.approver().run_project(h.project.id, false).await.unwrap();
        assert_eq!(report.approved_count, 2);
        assert_eq!(report.approved[0].destination_id, h.destination.id);
        assert_eq!(report.approved[1].destination_id, second.id);
        assert_eq!(report.approved[1].destination_platform, "tiktok");
    }

    #[tokio::test]
    async fn test_cooldown_blocks_recent_author() {
        let h = harness(enabled());
        h.add_approved("alice", &["old"], Utc::now() - Duration::hours(2));
        let candidate = h.add(0.9, "alice", &["food"]);

        let report = h.approver().run_project(h.project.id, true).await.unwrap();
        assert_eq!(report.skipped[0].candidate_id, candidate.id);
        assert_eq!(
            report.skipped[0].reason,
            "cooldown: 'author:alice' approved within 12h"
        );
    }

    #[tokio::test]
    async fn test_topic_run_cap_blocks_second_same_topic() {
        let h = harness(enabled());
        h.add(0.9, "alice", &["food"]);
        h.add(0.8, "bob", &["food"]);

        let report = h.approver().run_project(h.project.id, true).await.unwrap();
        assert_eq!(report.approved_count, 1);
        assert!(report.skipped[0].reason.starts_with("topic_run_cap: sig="));
        assert!(report.skipped[0].reason.ends_with(" 1/1"));
    }

    #[tokio::test]
    async fn test_author_cap_counts_today_approvals() {
        let mut feed = enabled();
        feed.cooldown_hours_per_source = 0;
        feed.max_per_author_per_day = 1;
        let h = harness(feed);
        h.add_approved("alice", &["old"], Utc::now());
        h.add(0.9, "alice", &["food"]);

        let report = h.approver().run_project(h.project.id, true).await.unwrap();
        assert_eq!(Harness::reasons(&report), vec!["author_cap: 'alice' 1/1".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_checked_before_cooldown() {
        let h = harness(enabled());
        let mut original = fixtures::candidate(h.project.id, 0.9, "alice", &["x"]);
        original.content_signature = Some("same".to_string());
        original.status = CandidateStatus::Used;
        original.reviewed_at = Some(Utc::now());
        let original = h.catalog.create_candidate(original).unwrap();

        let mut copy = fixtures::candidate(h.project.id, 0.9, "alice", &["y"]);
        copy.content_signature = Some("same".to_string());
        h.catalog.create_candidate(copy).unwrap();

        let report = h.approver().run_project(h.project.id, true).await.unwrap();
        assert_eq!(
            Harness::reasons(&report),
            vec![format!("duplicate: same content as #{} (status=used)", original.id)]
        );
    }

    #[tokio::test]
    async fn test_origin_filter_excludes_other_origins() {
        let mut feed = enabled();
        feed.origin_filter = OriginFilter::Generate;
        let h = harness(feed);
        h.add(0.9, "alice", &["food"]);

        let report = h.approver().run_project(h.project.id, true).await.unwrap();
        assert_eq!(report.approved_count, 0);
        assert_eq!(report.skipped_count, 0);
    }

    #[tokio::test]
    async fn test_no_active_destination_reports_error() {
        let tasks = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let catalog = Arc::new(SqliteCatalog::in_memory().unwrap());
        let project = catalog.create_project(Project::new("p")).unwrap();
        let mut inactive = fixtures::destination(project.id, "youtube");
        inactive.active = false;
        catalog.create_destination(inactive).unwrap();

        let approver = AutoApprover::new(tasks, catalog, Selector::default());
        let report = approver.run_project(project.id, false).await.unwrap();
        assert_eq!(report.error.as_deref(), Some("no active destinations"));
        assert_eq!(report.approved_count, 0);
    }

    #[tokio::test]
    async fn test_run_skips_disabled_projects() {
        let h = harness(FeedSettings::default());
        h.add(0.9, "alice", &["food"]);

        let run = h.approver().run_auto_approve(false).await.unwrap();
        assert_eq!(run.processed, 0);
        assert_eq!(run.total_approved, 0);

        let missing = h.approver().run_project(999, false).await;
        assert!(matches!(missing, Err(ApproveError::ProjectNotFound(999))));
    }
}
