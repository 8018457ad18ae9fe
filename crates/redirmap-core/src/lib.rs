use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod cache;
pub mod chunk;
pub mod confidence;
pub mod config;
pub mod fallback;
pub mod language;
pub mod matching;
pub mod pipeline;
pub mod reconcile;

pub use cache::{CacheKey, CachePolicy, MatchSnapshot, ResultCache};
pub use chunk::chunk;
pub use confidence::{filter, FilterOutcome};
pub use config::PipelineConfig;
pub use fallback::{FallbackResolver, LanguageCoverage};
pub use language::LanguageClassifier;
pub use matching::{ChunkMatch, MatchService, RetryPolicy, SemanticMatchClient};
pub use pipeline::{LanguageFailure, Pipeline, PipelineOutcome};
pub use reconcile::{reconcile, reconcile_records, reconcile_report, AmbiguousSource, Reconciled};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("matching failed (language {language}, chunk {chunk}, {attempts} attempt(s)): {cause}")]
    MatchingFailed {
        language: String,
        chunk: usize,
        attempts: u32,
        cause: String,
    },
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("export failed: {0}")]
    Export(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Short language/locale code, always stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageTag(String);

impl LanguageTag {
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LanguageTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// URLs bucketed by detected language. Buckets keep input order (duplicates included);
/// iteration over tags is sorted, which is the processing order of the pipeline.
pub type UrlGroup = BTreeMap<LanguageTag, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub source: String,
    pub target: String,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchChunk {
    /// Position of the chunk within its language, starting at 0.
    pub index: usize,
    pub source_urls: Vec<String>,
    pub candidate_targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackKind {
    MissingLanguage,
    Unmatched,
}

impl FallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackKind::MissingLanguage => "missing-language",
            FallbackKind::Unmatched => "unmatched",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRedirect {
    pub source: String,
    pub target: String,
    pub kind: FallbackKind,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedirectStatus {
    #[serde(rename = "301")]
    Permanent,
    #[serde(rename = "302")]
    Temporary,
}

impl RedirectStatus {
    pub fn code(&self) -> u16 {
        match self {
            RedirectStatus::Permanent => 301,
            RedirectStatus::Temporary => 302,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectRecord {
    pub source: String,
    pub target: String,
    pub status: RedirectStatus,
    pub confidence: f64,
    pub reason: String,
}

/// Request handed to the external semantic-matching service for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    pub source_urls: Vec<String>,
    pub candidate_targets: Vec<String>,
    pub language: LanguageTag,
    pub business_context: Option<String>,
    pub temperature: Option<f64>,
}
