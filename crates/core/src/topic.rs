//! Topic tags and topic signatures for anti-repeat checks.
//!
//! A topic signature is a stable fingerprint of a candidate's topic tags:
//! two candidates with the same tag set (ignoring case, order and
//! duplicates) share a signature.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::catalog::Candidate;

const MAX_TAGS: usize = 7;
const FALLBACK_WORDS: usize = 5;

/// Hex SHA-256 over the sorted, lowercased, deduplicated tags joined by `|`.
/// Returns an empty string when there are no usable tags.
pub fn topic_signature(tags: &[String]) -> String {
    let normalized: BTreeSet<String> = tags
        .iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();

    if normalized.is_empty() {
        return String::new();
    }

    let joined = normalized.into_iter().collect::<Vec<_>>().join("|");
    let digest = Sha256::digest(joined.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Lowercase, strip punctuation and collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Topic tags of a candidate: its explicit tags when present, otherwise the
/// first distinct words (longer than two characters) of title and caption.
pub fn extract_topic_tags(candidate: &Candidate) -> Vec<String> {
    let mut tags: Vec<String> = candidate
        .topic_tags
        .iter()
        .map(|tag| normalize_text(tag))
        .filter(|tag| !tag.is_empty())
        .collect();

    if tags.is_empty() {
        let mut text = candidate.title.clone().unwrap_or_default();
        if let Some(caption) = &candidate.caption {
            if candidate.title.as_ref() != Some(caption) {
                text.push(' ');
                text.push_str(caption);
            }
        }
        tags = normalize_text(&text)
            .split(' ')
            .filter(|word| word.chars().count() > 2)
            .map(str::to_string)
            .collect();
        let mut seen = BTreeSet::new();
        tags.retain(|word| seen.insert(word.clone()));
        tags.truncate(FALLBACK_WORDS);
    }

    let mut seen = BTreeSet::new();
    tags.retain(|tag| seen.insert(tag.clone()));
    tags.truncate(MAX_TAGS);
    tags
}

/// Fill in tags and signature on a candidate that has none yet.
pub fn ensure_topic(candidate: &mut Candidate) -> &str {
    if candidate.topic_signature.is_empty() {
        candidate.topic_tags = extract_topic_tags(candidate);
        candidate.topic_signature = topic_signature(&candidate.topic_tags);
    }
    &candidate.topic_signature
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CandidateOrigin;

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_signature_ignores_case_order_and_duplicates() {
        let a = topic_signature(&tags(&["Cats", "funny"]));
        let b = topic_signature(&tags(&["funny", "cats", " CATS "]));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_signature_differs_for_different_topics() {
        assert_ne!(
            topic_signature(&tags(&["cats"])),
            topic_signature(&tags(&["dogs"]))
        );
    }

    #[test]
    fn test_empty_tags_have_empty_signature() {
        assert_eq!(topic_signature(&[]), "");
        assert_eq!(topic_signature(&tags(&["  ", ""])), "");
    }

    #[test]
    fn test_extract_falls_back_to_title_words() {
        let mut candidate = Candidate::new(1, CandidateOrigin::Repurpose);
        candidate.title = Some("The cat and the CAT jumped, on a big box!".to_string());
        let extracted = extract_topic_tags(&candidate);
        assert_eq!(extracted, tags(&["the", "cat", "and", "jumped", "big"]));
    }

    #[test]
    fn test_ensure_topic_keeps_existing_signature() {
        let mut candidate = Candidate::new(1, CandidateOrigin::Repurpose);
        candidate.topic_signature = "fixed".to_string();
        assert_eq!(ensure_topic(&mut candidate), "fixed");

        let mut fresh = Candidate::new(1, CandidateOrigin::Repurpose);
        fresh.topic_tags = tags(&["Travel"]);
        let sig = ensure_topic(&mut fresh).to_string();
        assert_eq!(sig, topic_signature(&tags(&["travel"])));
    }
}
