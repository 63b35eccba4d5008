//! Counterparty name screening against a watchlist corpus.
//!
//! The corpus itself lives behind a collaborator that returns a bounded
//! candidate list; this module only ranks candidates by sequence similarity
//! and classifies the best score into none/partial/full.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::rules::factor;
use crate::SourceError;

/// Candidate retrieval caps, bounding matcher cost per request.
pub const MAX_ENTITY_CANDIDATES: usize = 500;
pub const MAX_ALIAS_CANDIDATES: usize = 1000;

/// One name drawn from the entity/alias corpus, tagged with the entity it
/// belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningCandidate {
    pub name: String,
    pub entity_ref: Option<i64>,
}

impl ScreeningCandidate {
    pub fn new(name: &str, entity_ref: i64) -> Self {
        Self {
            name: name.to_string(),
            entity_ref: Some(entity_ref),
        }
    }
}

/// Bounded candidate retrieval from the watchlist corpus.
pub trait CandidateSource: Send + Sync {
    fn fetch_candidates(&self, name_query: &str) -> Result<Vec<ScreeningCandidate>, SourceError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    None,
    Partial,
    Full,
}

/// Recommended handling derived from a screening outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScreeningAction {
    None,
    ManualReview,
    AutomaticBlockAndReport,
}

/// Best match found across all candidates compared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreeningResult {
    pub match_type: MatchType,
    pub best_score: f64,
    pub best_name: Option<String>,
    pub entity_ref: Option<i64>,
}

impl ScreeningResult {
    pub fn clear() -> Self {
        Self {
            match_type: MatchType::None,
            best_score: 0.0,
            best_name: None,
            entity_ref: None,
        }
    }

    /// Factor code this result contributes to the decision, if any.
    pub fn factor(&self) -> Option<&'static str> {
        match self.match_type {
            MatchType::Full => Some(factor::SCREENING_FULL_MATCH),
            MatchType::Partial => Some(factor::SCREENING_PARTIAL_MATCH),
            MatchType::None => None,
        }
    }

    pub fn action(&self) -> ScreeningAction {
        match self.match_type {
            MatchType::Full => ScreeningAction::AutomaticBlockAndReport,
            MatchType::Partial => ScreeningAction::ManualReview,
            MatchType::None => ScreeningAction::None,
        }
    }
}

/// Approximate name matcher over a pre-filtered candidate list.
pub struct WatchlistMatcher {
    whitespace: Regex,
    full_threshold: f64,
    partial_threshold: f64,
}

impl WatchlistMatcher {
    pub fn new() -> Self {
        Self::with_thresholds(0.95, 0.80)
    }

    pub fn with_thresholds(full_threshold: f64, partial_threshold: f64) -> Self {
        Self {
            // Static pattern, cannot fail to compile.
            whitespace: Regex::new(r"\s+").unwrap(),
            full_threshold,
            partial_threshold,
        }
    }

    fn normalize(&self, name: &str) -> String {
        self.whitespace
            .replace_all(name.trim(), " ")
            .to_lowercase()
    }

    /// Similarity of two names after normalization, in `[0.0, 1.0]`.
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let a: Vec<char> = self.normalize(a).chars().collect();
        let b: Vec<char> = self.normalize(b).chars().collect();
        similarity(&a, &b)
    }

    /// Closed-lower-bound classification of a similarity score.
    pub fn classify(&self, score: f64) -> MatchType {
        if score >= self.full_threshold {
            MatchType::Full
        } else if score >= self.partial_threshold {
            MatchType::Partial
        } else {
            MatchType::None
        }
    }

    /// Compare `name` against every candidate and keep the maximum
    /// similarity; ties keep the first maximum encountered.
    pub fn screen(&self, name: &str, candidates: &[ScreeningCandidate]) -> ScreeningResult {
        let query: Vec<char> = self.normalize(name).chars().collect();
        if query.is_empty() {
            return ScreeningResult::clear();
        }

        let mut best_score = 0.0;
        let mut best_name = None;
        let mut best_ref = None;

        let cap = MAX_ENTITY_CANDIDATES + MAX_ALIAS_CANDIDATES;
        for candidate in candidates.iter().take(cap) {
            let other: Vec<char> = self.normalize(&candidate.name).chars().collect();
            let score = similarity(&query, &other);
            if score > best_score {
                best_score = score;
                best_name = Some(candidate.name.clone());
                best_ref = candidate.entity_ref;
            }
        }

        ScreeningResult {
            match_type: self.classify(best_score),
            best_score,
            best_name,
            entity_ref: best_ref,
        }
    }
}

impl Default for WatchlistMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Ratcliff/Obershelp sequence similarity: twice the number of matching
/// characters over the combined length, where matches come from recursively
/// taking the longest common block.
fn similarity(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(a, b, 0, a.len(), 0, b.len()) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char], alo: usize, ahi: usize, blo: usize, bhi: usize) -> usize {
    let (i, j, k) = longest_match(a, b, alo, ahi, blo, bhi);
    if k == 0 {
        return 0;
    }
    k + matching_chars(a, b, alo, i, blo, j) + matching_chars(a, b, i + k, ahi, j + k, bhi)
}

fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut besti, mut bestj, mut bestk) = (alo, blo, 0usize);
    let mut run_ending_at: HashMap<usize, usize> = HashMap::new();

    for i in alo..ahi {
        let mut next_runs = HashMap::new();
        for j in blo..bhi {
            if a[i] == b[j] {
                let k = j
                    .checked_sub(1)
                    .and_then(|prev| run_ending_at.get(&prev).copied())
                    .unwrap_or(0)
                    + 1;
                next_runs.insert(j, k);
                if k > bestk {
                    besti = i + 1 - k;
                    bestj = j + 1 - k;
                    bestk = k;
                }
            }
        }
        run_ending_at = next_runs;
    }
    (besti, bestj, bestk)
}
