//! Types for projects, destinations and scored candidates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Weekday keys used in publish windows, Monday first.
pub const DAY_KEYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

// ============================================================================
// Project settings
// ============================================================================

/// Scheduled-publish settings of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishSettings {
    #[serde(default)]
    pub publish_enabled: bool,
    /// IANA timezone name; unknown names fall back to UTC.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Weekday key -> list of `["HH:MM", "HH:MM"]` windows.
    #[serde(default = "default_windows")]
    pub windows: BTreeMap<String, Vec<[String; 2]>>,
    #[serde(default = "default_min_gap")]
    pub min_gap_minutes_per_destination: i64,
    #[serde(default = "default_daily_limit")]
    pub daily_limit_per_destination: i64,
    #[serde(default)]
    pub jitter_minutes: i64,
    #[serde(default = "default_true")]
    pub topic_guard_enabled: bool,
    #[serde(default = "default_topic_last_n")]
    pub topic_guard_last_n: usize,
    #[serde(default = "default_cooldown_hours")]
    pub topic_guard_cooldown_hours: i64,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            publish_enabled: false,
            timezone: default_timezone(),
            windows: default_windows(),
            min_gap_minutes_per_destination: default_min_gap(),
            daily_limit_per_destination: default_daily_limit(),
            jitter_minutes: 0,
            topic_guard_enabled: true,
            topic_guard_last_n: default_topic_last_n(),
            topic_guard_cooldown_hours: default_cooldown_hours(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_windows() -> BTreeMap<String, Vec<[String; 2]>> {
    DAY_KEYS
        .iter()
        .map(|day| {
            (
                day.to_string(),
                vec![["00:00".to_string(), "23:59".to_string()]],
            )
        })
        .collect()
}

fn default_min_gap() -> i64 {
    90
}

fn default_daily_limit() -> i64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_topic_last_n() -> usize {
    5
}

fn default_cooldown_hours() -> i64 {
    12
}

/// Which candidate origins auto-approve considers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OriginFilter {
    #[default]
    All,
    Repurpose,
    Generate,
}

impl OriginFilter {
    pub fn accepts(&self, origin: CandidateOrigin) -> bool {
        match self {
            OriginFilter::All => true,
            OriginFilter::Repurpose => origin == CandidateOrigin::Repurpose,
            OriginFilter::Generate => origin == CandidateOrigin::Generate,
        }
    }
}

/// Auto-approve settings of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSettings {
    #[serde(default)]
    pub auto_approve_enabled: bool,
    #[serde(default = "default_daily_limit")]
    pub daily_limit_per_destination: i64,
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours_per_source: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score_override: Option<f64>,
    #[serde(default)]
    pub origin_filter: OriginFilter,
    #[serde(default = "default_true")]
    pub diversity_enabled: bool,
    #[serde(default = "default_per_day_cap")]
    pub max_per_author_per_day: i64,
    #[serde(default = "default_per_day_cap")]
    pub max_per_topic_per_day: i64,
    #[serde(default = "default_topic_run_cap")]
    pub max_same_topic_in_single_run: i64,
    /// Largest simhash distance still considered a near duplicate.
    #[serde(default = "default_simhash_distance")]
    pub simhash_max_distance: u32,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            auto_approve_enabled: false,
            daily_limit_per_destination: default_daily_limit(),
            cooldown_hours_per_source: default_cooldown_hours(),
            min_score_override: None,
            origin_filter: OriginFilter::All,
            diversity_enabled: true,
            max_per_author_per_day: default_per_day_cap(),
            max_per_topic_per_day: default_per_day_cap(),
            max_same_topic_in_single_run: default_topic_run_cap(),
            simhash_max_distance: default_simhash_distance(),
        }
    }
}

fn default_per_day_cap() -> i64 {
    2
}

fn default_topic_run_cap() -> i64 {
    1
}

fn default_simhash_distance() -> u32 {
    6
}

/// Transformations a project requires before anything may be published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPolicy {
    #[serde(default)]
    pub require_voice_change: bool,
    #[serde(default)]
    pub require_caption_rewrite: bool,
    #[serde(default)]
    pub require_visual_transform: bool,
    #[serde(default)]
    pub require_hook_rewrite: bool,
}

/// Target output format for a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_sec: Option<f64>,
}

/// One step of a project's processing preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetStep {
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub order_index: i64,
    #[serde(default)]
    pub params: Value,
}

impl PresetStep {
    pub fn new(tool_id: impl Into<String>, params: Value) -> Self {
        Self {
            tool_id: tool_id.into(),
            name: None,
            enabled: true,
            order_index: 0,
            params,
        }
    }
}

/// A content project: sources feed candidates, destinations receive output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub publish: PublishSettings,
    #[serde(default)]
    pub feed: FeedSettings,
    #[serde(default)]
    pub policy: ContentPolicy,
    #[serde(default)]
    pub export_profile: ExportProfile,
    #[serde(default)]
    pub preset: Vec<PresetStep>,
    /// Calibrated auto-approve threshold, if scoring has been calibrated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_threshold: Option<f64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            publish: PublishSettings::default(),
            feed: FeedSettings::default(),
            policy: ContentPolicy::default(),
            export_profile: ExportProfile::default(),
            preset: Vec::new(),
            calibration_threshold: None,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Destinations
// ============================================================================

/// A (platform, account) pair content is published to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub id: i64,
    pub project_id: i64,
    /// Lowercase platform name (`youtube`, `tiktok`, `instagram`, `vk`).
    pub platform: String,
    pub social_account_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Platform credentials. Never serialized into API responses or logs.
    #[serde(default, skip_serializing)]
    pub credentials: Map<String, Value>,
}

impl Destination {
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

// ============================================================================
// Candidates
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CandidateOrigin {
    #[default]
    Repurpose,
    Generate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    #[default]
    New,
    Approved,
    Rejected,
    /// Terminal: the candidate's task was published.
    Used,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::New => "new",
            CandidateStatus::Approved => "approved",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::Used => "used",
        }
    }
}

/// A scored piece of source content that may become a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: i64,
    pub project_id: i64,
    #[serde(default)]
    pub origin: CandidateOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Content score in `0.0..=1.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub topic_tags: Vec<String>,
    #[serde(default)]
    pub topic_signature: String,
    /// Exact-content fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_signature: Option<String>,
    /// 64-bit simhash as hex, for near-duplicate detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simhash: Option<String>,
    #[serde(default)]
    pub status: CandidateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_task_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    pub fn new(project_id: i64, origin: CandidateOrigin) -> Self {
        Self {
            id: 0,
            project_id,
            origin,
            url: None,
            author: None,
            brief_id: None,
            title: None,
            caption: None,
            score: None,
            topic_tags: Vec::new(),
            topic_signature: String::new(),
            content_signature: None,
            simhash: None,
            status: CandidateStatus::New,
            linked_task_id: None,
            reviewed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Key identifying the source for diversity ranking: the brief for
    /// generated content, otherwise the author (falling back to the url).
    pub fn author_key(&self) -> String {
        match self.origin {
            CandidateOrigin::Generate => self
                .brief_id
                .map(|id| format!("brief:{}", id))
                .unwrap_or_default(),
            CandidateOrigin::Repurpose => self
                .author
                .clone()
                .or_else(|| self.url.clone())
                .unwrap_or_default(),
        }
    }

    /// Grouping key for the per-source approval cooldown.
    pub fn cooldown_key(&self) -> Option<String> {
        match self.origin {
            CandidateOrigin::Generate => self.brief_id.map(|id| format!("brief:{}", id)),
            CandidateOrigin::Repurpose => match (&self.author, &self.url) {
                (Some(author), _) if !author.is_empty() => Some(format!("author:{}", author)),
                (_, Some(url)) if !url.is_empty() => Some(format!("url:{}", url)),
                _ => None,
            },
        }
    }

    pub fn base_score(&self) -> f64 {
        self.score.unwrap_or(0.0)
    }
}

/// Filter for querying candidates.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    pub project_id: Option<i64>,
    pub statuses: Vec<CandidateStatus>,
    /// Only candidates with `score >= min_score`.
    pub min_score: Option<f64>,
    /// Only candidates not yet linked to a task.
    pub unlinked: bool,
    /// Only candidates reviewed at or after this instant.
    pub reviewed_since: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl CandidateFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_project(mut self, project_id: i64) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_status(mut self, status: CandidateStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn unlinked(mut self) -> Self {
        self.unlinked = true;
        self
    }

    pub fn with_reviewed_since(mut self, since: DateTime<Utc>) -> Self {
        self.reviewed_since = Some(since);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }
}

/// Errors from catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_settings_defaults_from_empty_json() {
        let settings: PublishSettings = serde_json::from_str("{}").unwrap();
        assert!(!settings.publish_enabled);
        assert_eq!(settings.timezone, "UTC");
        assert_eq!(settings.min_gap_minutes_per_destination, 90);
        assert_eq!(settings.daily_limit_per_destination, 3);
        assert_eq!(settings.jitter_minutes, 0);
        assert!(settings.topic_guard_enabled);
        assert_eq!(settings.topic_guard_last_n, 5);
        assert_eq!(settings.windows.len(), 7);
        assert_eq!(settings.windows["wed"][0][1], "23:59");
    }

    #[test]
    fn test_publish_settings_partial_override() {
        let json = r#"{
            "publish_enabled": true,
            "timezone": "Europe/Berlin",
            "windows": {"mon": [["10:00", "22:00"]]},
            "jitter_minutes": 10
        }"#;
        let settings: PublishSettings = serde_json::from_str(json).unwrap();
        assert!(settings.publish_enabled);
        assert_eq!(settings.windows.len(), 1);
        assert_eq!(settings.jitter_minutes, 10);
        assert_eq!(settings.daily_limit_per_destination, 3);
    }

    #[test]
    fn test_feed_settings_origin_filter() {
        let settings: FeedSettings =
            serde_json::from_str(r#"{"origin_filter": "GENERATE"}"#).unwrap();
        assert_eq!(settings.origin_filter, OriginFilter::Generate);
        assert!(settings.origin_filter.accepts(CandidateOrigin::Generate));
        assert!(!settings.origin_filter.accepts(CandidateOrigin::Repurpose));
        assert!(OriginFilter::All.accepts(CandidateOrigin::Repurpose));
    }

    #[test]
    fn test_author_key() {
        let mut repurposed = Candidate::new(1, CandidateOrigin::Repurpose);
        repurposed.url = Some("https://example.com/v/1".to_string());
        assert_eq!(repurposed.author_key(), "https://example.com/v/1");
        repurposed.author = Some("creator".to_string());
        assert_eq!(repurposed.author_key(), "creator");

        let mut generated = Candidate::new(1, CandidateOrigin::Generate);
        generated.author = Some("ignored".to_string());
        assert_eq!(generated.author_key(), "");
        generated.brief_id = Some(9);
        assert_eq!(generated.author_key(), "brief:9");
    }

    #[test]
    fn test_cooldown_key() {
        let mut candidate = Candidate::new(1, CandidateOrigin::Repurpose);
        assert_eq!(candidate.cooldown_key(), None);
        candidate.url = Some("u".to_string());
        assert_eq!(candidate.cooldown_key().as_deref(), Some("url:u"));
        candidate.author = Some("a".to_string());
        assert_eq!(candidate.cooldown_key().as_deref(), Some("author:a"));
    }

    #[test]
    fn test_destination_credentials_not_serialized() {
        let mut credentials = Map::new();
        credentials.insert("access_token".to_string(), Value::from("secret"));
        let destination = Destination {
            id: 1,
            project_id: 1,
            platform: "youtube".to_string(),
            social_account_id: 5,
            handle: None,
            active: true,
            credentials,
        };
        assert_eq!(destination.credential("access_token"), Some("secret"));
        let json = serde_json::to_string(&destination).unwrap();
        assert!(!json.contains("secret"));
    }
}
