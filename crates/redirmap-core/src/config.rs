use crate::{Error, LanguageTag, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Every knob the pipeline consumes. Validated once, when the pipeline is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub chunk_size: usize,
    pub max_candidates_per_chunk: usize,
    pub confidence_threshold: f64,
    /// Retries after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt.
    pub retry_base_delay_ms: u64,
    /// Returned by the classifier when no rule matches.
    pub default_language: LanguageTag,
    /// Landing language for missing-language and unknown-language fallbacks.
    pub fallback_language: LanguageTag,
    /// Absolute prefix for fallback targets, e.g. `https://www.example.com`.
    pub target_domain: Option<String>,
    /// Language served at the root of `target_domain` (targets become `{domain}/`).
    pub root_language: Option<LanguageTag>,
    pub business_context: Option<String>,
    pub temperature: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            max_candidates_per_chunk: 200,
            confidence_threshold: 0.7,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            default_language: LanguageTag::new("fr"),
            fallback_language: LanguageTag::new("fr"),
            target_domain: None,
            root_language: None,
            business_context: None,
            temperature: 0.1,
        }
    }
}

fn validate_tag(field: &str, tag: &LanguageTag) -> Result<()> {
    let s = tag.as_str();
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::InvalidInput(format!(
            "{field} must be a non-empty language code, got {s:?}"
        )));
    }
    Ok(())
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidInput("chunk_size must be > 0".to_string()));
        }
        if self.max_candidates_per_chunk == 0 {
            return Err(Error::InvalidInput(
                "max_candidates_per_chunk must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::InvalidInput(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::InvalidInput(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        validate_tag("default_language", &self.default_language)?;
        validate_tag("fallback_language", &self.fallback_language)?;
        if let Some(root) = &self.root_language {
            validate_tag("root_language", root)?;
        }
        if let Some(domain) = &self.target_domain {
            let u = url::Url::parse(domain.trim())
                .map_err(|e| Error::InvalidInput(format!("invalid target_domain: {e}")))?;
            if !matches!(u.scheme(), "http" | "https") || u.host_str().is_none() {
                return Err(Error::InvalidInput(format!(
                    "target_domain must be an absolute http(s) URL, got {domain:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Trimmed business context; `None` when blank.
    pub fn business_context(&self) -> Option<&str> {
        self.business_context
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}
