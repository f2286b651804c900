//! Exact and near-duplicate detection against already approved content.
//!
//! Near duplicates are found with a 64-bit simhash over word unigrams and
//! bigrams; two texts are near duplicates when the Hamming distance of
//! their hashes is small.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::catalog::{Candidate, CandidateFilter, CandidateStatus, CatalogError, CatalogStore};
use crate::topic::normalize_text;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "of", "for", "with", "is", "it",
    "и", "в", "на", "с", "по", "к", "из", "за", "от", "у", "о", "а", "но", "что", "это", "как",
    "не", "для",
];

/// Approved/used candidates scanned per lookup.
const SCAN_LIMIT: i64 = 10_000;

/// Number of differing bits between two hashes.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

fn tokenize(text: &str) -> Vec<String> {
    normalize_text(text)
        .split(' ')
        .filter(|t| t.chars().count() > 1 && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn hash64(feature: &str) -> u64 {
    let digest = Sha256::digest(feature.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Simhash of a text. Zero for text without usable words.
pub fn text_simhash(text: &str) -> u64 {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return 0;
    }

    let bigrams = tokens.windows(2).map(|w| format!("{}_{}", w[0], w[1]));
    let features: Vec<String> = tokens.iter().cloned().chain(bigrams).collect();

    let mut weights = [0i64; 64];
    for feature in &features {
        let h = hash64(feature);
        for (bit, weight) in weights.iter_mut().enumerate() {
            if h & (1 << bit) != 0 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }

    weights
        .iter()
        .enumerate()
        .filter(|(_, w)| **w > 0)
        .fold(0u64, |acc, (bit, _)| acc | (1 << bit))
}

pub fn simhash_hex(value: u64) -> String {
    format!("{:016x}", value)
}

/// Parse a stored hex simhash. Zero and malformed values carry no signal.
pub fn parse_simhash(hex: &str) -> Option<u64> {
    u64::from_str_radix(hex.trim(), 16)
        .ok()
        .filter(|v| *v != 0)
}

/// Finds earlier approved content a candidate duplicates.
pub trait DuplicateDetector: Send + Sync {
    /// An approved or used candidate with the same content signature.
    fn find_duplicate(&self, candidate: &Candidate) -> Result<Option<Candidate>, CatalogError>;

    /// The closest approved or used candidate within `max_distance`, with
    /// its distance.
    fn find_near_duplicate(
        &self,
        candidate: &Candidate,
        max_distance: u32,
    ) -> Result<Option<(Candidate, u32)>, CatalogError>;
}

/// Detector scanning a project's approved candidates in the catalog.
pub struct CatalogDuplicateDetector {
    catalog: Arc<dyn CatalogStore>,
}

impl CatalogDuplicateDetector {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    fn approved(&self, candidate: &Candidate) -> Result<Vec<Candidate>, CatalogError> {
        let filter = CandidateFilter::new()
            .with_project(candidate.project_id)
            .with_status(CandidateStatus::Approved)
            .with_status(CandidateStatus::Used)
            .with_limit(SCAN_LIMIT);
        Ok(self
            .catalog
            .list_candidates(&filter)?
            .into_iter()
            .filter(|c| c.id != candidate.id)
            .collect())
    }
}

impl DuplicateDetector for CatalogDuplicateDetector {
    fn find_duplicate(&self, candidate: &Candidate) -> Result<Option<Candidate>, CatalogError> {
        let signature = match candidate.content_signature.as_deref() {
            Some(sig) if !sig.is_empty() => sig,
            _ => return Ok(None),
        };
        Ok(self
            .approved(candidate)?
            .into_iter()
            .find(|c| c.content_signature.as_deref() == Some(signature)))
    }

    fn find_near_duplicate(
        &self,
        candidate: &Candidate,
        max_distance: u32,
    ) -> Result<Option<(Candidate, u32)>, CatalogError> {
        let Some(target) = candidate.simhash.as_deref().and_then(parse_simhash) else {
            return Ok(None);
        };

        let mut best: Option<(Candidate, u32)> = None;
        for other in self.approved(candidate)? {
            let Some(hash) = other.simhash.as_deref().and_then(parse_simhash) else {
                continue;
            };
            let distance = hamming_distance(target, hash);
            if distance <= max_distance && best.as_ref().map_or(true, |(_, d)| distance < *d) {
                best = Some((other, distance));
            }
        }
        Ok(best)
    }
}
