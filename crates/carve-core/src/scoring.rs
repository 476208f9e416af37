use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Scoring tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Length of the contiguous word run that counts as missing/extra content.
    pub content_run_words: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            content_run_words: 5,
        }
    }
}

/// Similarity between an extraction and its ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub abs_levenshtein_distance_norm: f64,
    pub exact_match: bool,
    pub missing_content: bool,
    pub extra_content: bool,
}

impl Metrics {
    pub fn accuracy(&self) -> f64 {
        1.0 - self.abs_levenshtein_distance_norm
    }
}

/// Score `actual` against `expected`.
///
/// The distance is word-level Levenshtein divided by the number of expected
/// words (at least one), clamped to `[0, 1]`. Both inputs are
/// whitespace-normalized first, the same way the selector engine normalizes
/// its output.
pub fn score(expected: &str, actual: &str, config: &ScoringConfig) -> Metrics {
    let expected_words: Vec<&str> = expected.split_whitespace().collect();
    let actual_words: Vec<&str> = actual.split_whitespace().collect();

    let distance = word_distance(&expected_words, &actual_words);
    let norm = (distance as f64 / expected_words.len().max(1) as f64).clamp(0.0, 1.0);
    let run = config.content_run_words.max(1);

    Metrics {
        abs_levenshtein_distance_norm: norm,
        exact_match: expected_words == actual_words,
        missing_content: has_absent_run(&expected_words, &actual_words, run),
        extra_content: has_absent_run(&actual_words, &expected_words, run),
    }
}

/// Above this many DP cells the distance falls back to its upper bound.
const MAX_CELLS: usize = 4_000_000;

/// Levenshtein distance over word sequences.
///
/// A shared prefix and suffix are stripped first. When the differing middle
/// sections would still need more than `MAX_CELLS` cells, the result is the
/// longer middle's length, which never underestimates the true distance.
pub fn word_distance(a: &[&str], b: &[&str]) -> usize {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let (a, b) = (&a[prefix..], &b[prefix..]);
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let (a, b) = (&a[..a.len() - suffix], &b[..b.len() - suffix]);

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    if (a.len() + 1) * (b.len() + 1) > MAX_CELLS {
        return a.len().max(b.len());
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, wa) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, wb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(wa != wb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// True when `source` holds a run of `run` consecutive words that never
/// appears in `other`. Sequences shorter than `run` are checked as a whole.
fn has_absent_run(source: &[&str], other: &[&str], run: usize) -> bool {
    if source.is_empty() {
        return false;
    }
    if source.len() < run {
        return !other.windows(source.len()).any(|w| w == source);
    }

    let present: HashSet<&[&str]> = other.windows(run).collect();
    source.windows(run).any(|w| !present.contains(w))
}
