use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The four selector lists of a parser config.
///
/// Each entry is a CSS selector. `root` narrows the document to candidate
/// subtrees, `keep` and `drop` filter inside them (drop wins), and `unwrap`
/// flattens wrapper elements without losing their text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSet {
    #[serde(default)]
    pub root: Vec<String>,
    #[serde(default)]
    pub keep: Vec<String>,
    #[serde(default)]
    pub drop: Vec<String>,
    #[serde(default)]
    pub unwrap: Vec<String>,
}

impl SelectorSet {
    pub fn with_root(mut self, selectors: &[&str]) -> Self {
        self.root = selectors.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_keep(mut self, selectors: &[&str]) -> Self {
        self.keep = selectors.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_drop(mut self, selectors: &[&str]) -> Self {
        self.drop = selectors.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_unwrap(mut self, selectors: &[&str]) -> Self {
        self.unwrap = selectors.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Order-preserving union of two selector sets, duplicates removed.
    pub fn merge(&self, other: &SelectorSet) -> SelectorSet {
        fn union(a: &[String], b: &[String]) -> Vec<String> {
            let mut out: Vec<String> = Vec::with_capacity(a.len() + b.len());
            for s in a.iter().chain(b) {
                let s = s.trim();
                if !s.is_empty() && !out.iter().any(|existing| existing == s) {
                    out.push(s.to_string());
                }
            }
            out
        }

        SelectorSet {
            root: union(&self.root, &other.root),
            keep: union(&self.keep, &other.keep),
            drop: union(&self.drop, &other.drop),
            unwrap: union(&self.unwrap, &other.unwrap),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.keep.is_empty() && self.drop.is_empty() && self.unwrap.is_empty()
    }
}

/// An immutable extraction rule set bound to a URL prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserConfig {
    pub id: Uuid,
    pub prefix: String,
    pub selectors: SelectorSet,
    pub created_at: DateTime<Utc>,
}

impl ParserConfig {
    pub fn new(prefix: impl Into<String>, selectors: SelectorSet) -> Self {
        Self {
            id: Uuid::new_v4(),
            prefix: prefix.into(),
            selectors,
            created_at: Utc::now(),
        }
    }
}

/// Labeled ground truth for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCase {
    pub url: String,
    pub raw_content: String,
    pub expected_content: String,
}

/// Text produced by applying a config to one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub url: String,
    pub config_id: Uuid,
    pub parsed_content: String,
}

/// The persisted parsed form of a production URL. One row per URL; the last
/// write wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub url: String,
    pub prefix: String,
    pub config_id: Uuid,
    pub parsed_content: String,
    /// SHA-256 of the raw content the text was extracted from
    pub content_hash: String,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractionRecord {
    pub fn new(result: ExtractionResult, prefix: impl Into<String>, raw_content: &str) -> Self {
        Self {
            url: result.url,
            prefix: prefix.into(),
            config_id: result.config_id,
            parsed_content: result.parsed_content,
            content_hash: compute_hash(raw_content),
            extracted_at: Utc::now(),
        }
    }
}

/// Score of one (sample, config) pair inside an evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub url: String,
    pub domain: String,
    pub config_name: String,
    pub expected_content: String,
    pub parsed_content: String,
    pub abs_levenshtein_distance_norm: f64,
    pub exact_match: bool,
    pub missing_content: bool,
    pub extra_content: bool,
}

impl EvaluationResult {
    pub fn accuracy(&self) -> f64 {
        1.0 - self.abs_levenshtein_distance_norm
    }
}

/// An immutable batch of evaluation results, written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRun {
    pub id: Uuid,
    pub datetime: DateTime<Utc>,
    pub results: Vec<EvaluationResult>,
}

/// Listing entry for stored runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHeader {
    pub id: Uuid,
    pub datetime: DateTime<Utc>,
    pub result_count: usize,
}

/// Global run/pause switch read by every worker before it dequeues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SystemState {
    #[default]
    Running,
    Pause,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Running => "RUNNING",
            SystemState::Pause => "PAUSE",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SystemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RUNNING" => Ok(SystemState::Running),
            "PAUSE" | "PAUSED" => Ok(SystemState::Pause),
            _ => Err(format!("State must be either 'PAUSE' or 'RUNNING', got: {s}")),
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
