//! Scan outcomes as they cross the scanner, cache and delivery boundaries

use serde::{Deserialize, Serialize};
use std::fmt;

/// One rule or signature that contributed to a verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanDetail {
    pub code: String,
    pub score: f64,
    pub description: String,
}

impl ScanDetail {
    pub fn new(code: impl Into<String>, score: f64, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            score,
            description: description.into(),
        }
    }
}

/// Verdict produced by the external scanners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub score: f64,
    pub threat: bool,
    pub details: Vec<ScanDetail>,
    pub message: String,
}

impl ScanOutcome {
    pub fn clean(score: f64) -> Self {
        Self {
            score,
            threat: false,
            details: Vec::new(),
            message: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: ScanDetail) -> Self {
        self.details.push(detail);
        self
    }
}

/// Which key produced a cache hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Full,
    Attachment,
    Template,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Full => "full",
            MatchKind::Attachment => "attachment",
            MatchKind::Template => "template",
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reusable prior outcome
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub entry_id: i64,
    pub match_kind: MatchKind,
    pub outcome: ScanOutcome,
}
