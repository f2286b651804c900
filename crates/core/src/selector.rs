//! Diversity-aware ranking of candidates and tasks.
//!
//! Pure top-score selection keeps surfacing the same source and topic. The
//! selector subtracts fixed penalties from an item's base score when it
//! repeats the last-published (or a recently published) topic or author on
//! the same destination, then sorts by the resulting effective score.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::Candidate;

/// Penalty constants, applied once per dimension (topic, author).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Penalties {
    /// Same topic as the very last publish.
    #[serde(default = "default_topic_last")]
    pub topic_last: f64,
    /// Topic among the recent publishes (but not the last).
    #[serde(default = "default_topic_recent")]
    pub topic_recent: f64,
    /// Same author as the very last publish.
    #[serde(default = "default_author_last")]
    pub author_last: f64,
    /// Author among the recent publishes (but not the last).
    #[serde(default = "default_author_recent")]
    pub author_recent: f64,
    /// How many ranked items to include in debug dumps.
    #[serde(default = "default_debug_top_n")]
    pub debug_top_n: usize,
}

fn default_topic_last() -> f64 {
    0.15
}

fn default_topic_recent() -> f64 {
    0.05
}

fn default_author_last() -> f64 {
    0.10
}

fn default_author_recent() -> f64 {
    0.03
}

fn default_debug_top_n() -> usize {
    5
}

impl Default for Penalties {
    fn default() -> Self {
        Self {
            topic_last: default_topic_last(),
            topic_recent: default_topic_recent(),
            author_last: default_author_last(),
            author_recent: default_author_recent(),
            debug_top_n: default_debug_top_n(),
        }
    }
}

/// Per-destination publish history used for penalties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionState {
    pub last_topic_signature: String,
    pub last_author_key: String,
    pub recent_topic_signatures: HashSet<String>,
    pub recent_author_keys: HashSet<String>,
}

impl SelectionState {
    /// Build state from history candidates ordered newest first.
    pub fn from_history<'a>(history: impl IntoIterator<Item = &'a Candidate>) -> Self {
        let mut state = SelectionState::default();
        for (i, candidate) in history.into_iter().enumerate() {
            let author = candidate.author_key();
            if i == 0 {
                state.last_topic_signature = candidate.topic_signature.clone();
                state.last_author_key = author.clone();
            }
            if !candidate.topic_signature.is_empty() {
                state
                    .recent_topic_signatures
                    .insert(candidate.topic_signature.clone());
            }
            if !author.is_empty() {
                state.recent_author_keys.insert(author);
            }
        }
        state
    }
}

/// Something to rank.
#[derive(Debug, Clone)]
pub struct RankInput<T> {
    pub item: T,
    pub id: i64,
    pub base_score: f64,
    pub topic_signature: String,
    pub author_key: String,
    pub created_at: DateTime<Utc>,
}

/// A ranked item with its score breakdown.
#[derive(Debug, Clone)]
pub struct ScoredItem<T> {
    pub item: T,
    pub id: i64,
    pub base_score: f64,
    pub effective_score: f64,
    pub penalties: BTreeMap<String, f64>,
    pub topic_signature: String,
    pub author_key: String,
    pub created_at: DateTime<Utc>,
}

/// Debug dump entry for operator inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankDebug {
    pub id: i64,
    pub base_score: f64,
    pub effective_score: f64,
    pub penalties: BTreeMap<String, f64>,
}

/// Effective score and the penalties that produced it.
pub fn compute_effective_score(
    base_score: f64,
    topic_signature: &str,
    author_key: &str,
    state: &SelectionState,
    penalties: &Penalties,
) -> (f64, BTreeMap<String, f64>) {
    let mut applied = BTreeMap::new();

    if !topic_signature.is_empty() {
        if topic_signature == state.last_topic_signature {
            applied.insert("topic_last".to_string(), penalties.topic_last);
        } else if state.recent_topic_signatures.contains(topic_signature) {
            applied.insert("topic_recent".to_string(), penalties.topic_recent);
        }
    }

    if !author_key.is_empty() {
        if author_key == state.last_author_key {
            applied.insert("author_last".to_string(), penalties.author_last);
        } else if state.recent_author_keys.contains(author_key) {
            applied.insert("author_recent".to_string(), penalties.author_recent);
        }
    }

    let total: f64 = applied.values().sum();
    ((base_score - total).max(0.0), applied)
}

/// Ranks items by effective score.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    penalties: Penalties,
}

impl Selector {
    pub fn new(penalties: Penalties) -> Self {
        Self { penalties }
    }

    pub fn penalties(&self) -> &Penalties {
        &self.penalties
    }

    /// Sort by `(effective desc, base desc, created_at asc)`; id breaks any
    /// remaining tie so identical inputs always rank identically.
    pub fn rank<T>(&self, items: Vec<RankInput<T>>, state: &SelectionState) -> Vec<ScoredItem<T>> {
        let mut scored: Vec<ScoredItem<T>> = items
            .into_iter()
            .map(|input| {
                let (effective_score, penalties) = compute_effective_score(
                    input.base_score,
                    &input.topic_signature,
                    &input.author_key,
                    state,
                    &self.penalties,
                );
                ScoredItem {
                    item: input.item,
                    id: input.id,
                    base_score: input.base_score,
                    effective_score,
                    penalties,
                    topic_signature: input.topic_signature,
                    author_key: input.author_key,
                    created_at: input.created_at,
                }
            })
            .collect();

        scored.sort_by(rank_order);
        scored
    }

    /// Top entries for the debug dump.
    pub fn top_debug<T>(&self, scored: &[ScoredItem<T>]) -> Vec<RankDebug> {
        top_debug(scored, self.penalties.debug_top_n)
    }
}

/// Ranking order: effective desc, base desc, oldest first, then id.
pub fn rank_order<T>(a: &ScoredItem<T>, b: &ScoredItem<T>) -> Ordering {
    b.effective_score
        .total_cmp(&a.effective_score)
        .then_with(|| b.base_score.total_cmp(&a.base_score))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// First `n` ranked items with scores rounded to 4 places.
pub fn top_debug<T>(scored: &[ScoredItem<T>], n: usize) -> Vec<RankDebug> {
    scored
        .iter()
        .take(n)
        .map(|item| RankDebug {
            id: item.id,
            base_score: round4(item.base_score),
            effective_score: round4(item.effective_score),
            penalties: item
                .penalties
                .iter()
                .map(|(k, v)| (k.clone(), round4(*v)))
                .collect(),
        })
        .collect()
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Rank input for a candidate.
pub fn candidate_input(candidate: &Candidate) -> RankInput<Candidate> {
    RankInput {
        id: candidate.id,
        base_score: candidate.base_score(),
        topic_signature: candidate.topic_signature.clone(),
        author_key: candidate.author_key(),
        created_at: candidate.created_at,
        item: candidate.clone(),
    }
}
