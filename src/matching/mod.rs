//! Track identity matching and confidence scoring.
//!
//! Pure functions only: everything here is deterministic for identical
//! inputs, so scores can be asserted exactly in tests.
//!
//! Scoring is a weighted average over the fields present on both sides:
//!
//! | Field  | Weight | Comparison                              |
//! |--------|--------|-----------------------------------------|
//! | title  | 0.45   | normalized Levenshtein on normalized text |
//! | artist | 0.35   | normalized Levenshtein on normalized text |
//! | album  | 0.10   | normalized Levenshtein on normalized text |
//! | year   | 0.10   | tolerance bands (±1 full, ±3 partial)   |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::Track;

const TITLE_WEIGHT: f32 = 0.45;
const ARTIST_WEIGHT: f32 = 0.35;
const ALBUM_WEIGHT: f32 = 0.10;
const YEAR_WEIGHT: f32 = 0.10;

const YEAR_PARTIAL_CREDIT: f32 = 0.6;
const YEAR_LOW_CREDIT: f32 = 0.2;

const FEATURING_MARKERS: [&str; 3] = ["feat", "ft", "featuring"];

/// Discretized confidence bucket. Ordered: `None < Low < ... < Exact`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    #[default]
    None,
    Low,
    Medium,
    High,
    Exact,
}

impl QualityTier {
    pub const ALL: [QualityTier; 5] = [
        QualityTier::Exact,
        QualityTier::High,
        QualityTier::Medium,
        QualityTier::Low,
        QualityTier::None,
    ];

    /// Bucket a confidence value using the given breakpoints.
    pub fn from_confidence(confidence: f32, thresholds: &Thresholds) -> Self {
        if confidence >= thresholds.exact {
            QualityTier::Exact
        } else if confidence >= thresholds.high {
            QualityTier::High
        } else if confidence >= thresholds.medium {
            QualityTier::Medium
        } else if confidence >= thresholds.low {
            QualityTier::Low
        } else {
            QualityTier::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::None => "none",
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
            QualityTier::Exact => "exact",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier breakpoints (inclusive lower bounds).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub exact: f32,
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            exact: 0.95,
            high: 0.85,
            medium: 0.70,
            low: 0.50,
        }
    }
}

/// Outcome of a match attempt. `found` always equals `quality_tier != None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub found: bool,
    pub confidence: f32,
    pub quality_tier: QualityTier,
    /// Backend-specific locator of the matched item
    pub target: Option<String>,
    /// Evidence used to reach the score
    pub metadata: BTreeMap<String, String>,
}

impl MatchResult {
    /// Nothing matched.
    pub fn not_found() -> Self {
        Self::default()
    }

    /// Build a result whose tier and `found` flag follow from `confidence`.
    pub fn scored(confidence: f32, thresholds: &Thresholds, target: Option<String>) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        let quality_tier = QualityTier::from_confidence(confidence, thresholds);
        Self {
            found: quality_tier != QualityTier::None,
            confidence,
            quality_tier,
            target,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a piece of evidence.
    pub fn with_evidence(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the match is good enough to start a download.
    pub fn is_acceptable(&self, min_confidence: f32) -> bool {
        self.found && self.confidence >= min_confidence
    }
}

/// Metadata describing a candidate (a file, a search hit) to score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub artist: String,
    pub title: String,
    pub album: String,
    /// 0 when unknown
    pub year: i32,
}

/// Normalize text for comparison.
///
/// Drops bracketed qualifiers ("(Remix)", "[Live]"), cuts featuring clauses,
/// replaces punctuation with spaces, lower-cases and collapses whitespace.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();

    let mut depth = 0usize;
    let mut unbracketed = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                unbracketed.push(' ');
            }
            _ if depth == 0 => unbracketed.push(c),
            _ => {}
        }
    }

    let spaced: String = unbracketed
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    spaced
        .split_whitespace()
        .take_while(|word| !FEATURING_MARKERS.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Symmetric similarity in [0, 1] between two strings after normalization.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a = normalize(a);
    let b = normalize(b);
    strsim::normalized_levenshtein(&a, &b) as f32
}

/// Year credit using tolerance bands.
pub fn year_credit(a: i32, b: i32) -> f32 {
    match (a - b).abs() {
        0..=1 => 1.0,
        2..=3 => YEAR_PARTIAL_CREDIT,
        _ => YEAR_LOW_CREDIT,
    }
}

/// Confidence that `candidate` is the same recording as `target`.
///
/// Only fields present on both sides contribute. Returns 0.0 when nothing
/// can be compared.
pub fn score(candidate: &Candidate, target: &Track) -> f32 {
    let mut total = 0.0f32;
    let mut weight = 0.0f32;

    let mut text_field = |w: f32, a: &str, b: &str| {
        if !a.trim().is_empty() && !b.trim().is_empty() {
            total += w * similarity(a, b);
            weight += w;
        }
    };
    text_field(TITLE_WEIGHT, &candidate.title, &target.title);
    text_field(ARTIST_WEIGHT, &candidate.artist, &target.artist);
    text_field(ALBUM_WEIGHT, &candidate.album, &target.album);

    if candidate.year > 0 && target.release_year > 0 {
        total += YEAR_WEIGHT * year_credit(candidate.year, target.release_year);
        weight += YEAR_WEIGHT;
    }

    if weight == 0.0 {
        0.0
    } else {
        (total / weight).clamp(0.0, 1.0)
    }
}

/// Score `candidate` and bucket it into a [`MatchResult`].
pub fn evaluate(
    candidate: &Candidate,
    target: &Track,
    thresholds: &Thresholds,
    locator: Option<String>,
) -> MatchResult {
    let confidence = score(candidate, target);
    MatchResult::scored(confidence, thresholds, locator)
        .with_evidence("artist", candidate.artist.clone())
        .with_evidence("title", candidate.title.clone())
}


/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn text() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 ()\\[\\].,&'-]{0,40}"
    }

    proptest! {
        /// Higher confidence never lands in a lower tier
        #[test]
        fn tier_is_monotonic(a in 0.0f32..=1.0, b in 0.0f32..=1.0) {
            let t = Thresholds::default();
            let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
            prop_assert!(QualityTier::from_confidence(hi, &t) >= QualityTier::from_confidence(lo, &t));
        }

        /// Similarity does not depend on argument order
        #[test]
        fn similarity_is_symmetric(a in text(), b in text()) {
            prop_assert_eq!(similarity(&a, &b), similarity(&b, &a));
        }

        /// Identical strings are fully similar
        #[test]
        fn similarity_of_self_is_one(a in text()) {
            prop_assert_eq!(similarity(&a, &a), 1.0);
        }

        /// Scores stay within [0, 1]
        #[test]
        fn score_is_bounded(
            artist in text(),
            title in text(),
            album in text(),
            year in 0i32..2100,
        ) {
            let c = Candidate { artist, title, album, year };
            let target = Track::new("Song", "Artist", "Album", "").with_release_year(2000);
            let s = score(&c, &target);
            prop_assert!((0.0..=1.0).contains(&s));
        }

        /// Normalization is idempotent
        #[test]
        fn normalize_is_idempotent(a in text()) {
            let once = normalize(&a);
            prop_assert_eq!(normalize(&once), once.clone());
        }
    }
}
