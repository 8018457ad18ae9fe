//! Semantic matching of one chunk against the external service.
//!
//! Transport failures are retried with exponential backoff; a response that does not
//! parse into the expected shape fails immediately.

use crate::{Error, LanguageTag, MatchCandidate, MatchChunk, MatchRequest, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// The external semantic-matching capability: takes a request, returns the raw model text.
///
/// Any error returned here is treated as transient and retried.
#[async_trait::async_trait]
pub trait MatchService: Send + Sync {
    fn name(&self) -> &'static str;
    async fn complete(&self, req: &MatchRequest) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): base, 2*base, 4*base, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Result of one chunk: every correspondence the service proposed (confidence filtering is
/// applied downstream) plus the sources it could not place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub accepted: Vec<MatchCandidate>,
    pub explicitly_unmatched: Vec<String>,
}

enum RetryState {
    Attempting(u32),
    TransientFailure { attempt: u32, cause: Error },
    Exhausted { attempts: u32, cause: Error },
}

#[derive(Debug, Clone)]
pub struct SemanticMatchClient<S> {
    service: S,
    policy: RetryPolicy,
    temperature: Option<f64>,
}

impl<S: MatchService> SemanticMatchClient<S> {
    pub fn new(service: S, policy: RetryPolicy) -> Self {
        Self {
            service,
            policy,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn match_chunk(
        &self,
        chunk: &MatchChunk,
        business_context: Option<&str>,
        language: &LanguageTag,
    ) -> Result<ChunkMatch> {
        let req = MatchRequest {
            source_urls: chunk.source_urls.clone(),
            candidate_targets: chunk.candidate_targets.clone(),
            language: language.clone(),
            business_context: business_context
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            temperature: self.temperature,
        };

        let mut state = RetryState::Attempting(1);
        loop {
            state = match state {
                RetryState::Attempting(attempt) => match self.service.complete(&req).await {
                    Ok(raw) => {
                        let parsed = parse_match_response(&raw).map_err(|e| {
                            tracing::error!(
                                service = self.service.name(),
                                language = %language,
                                chunk = chunk.index,
                                attempt,
                                error = %e,
                                "unparseable matching response"
                            );
                            Error::MatchingFailed {
                                language: language.to_string(),
                                chunk: chunk.index,
                                attempts: attempt,
                                cause: e.to_string(),
                            }
                        })?;
                        tracing::debug!(
                            language = %language,
                            chunk = chunk.index,
                            attempt,
                            candidates = parsed.accepted.len(),
                            unmatched = parsed.explicitly_unmatched.len(),
                            "chunk matched"
                        );
                        return Ok(align_to_chunk(chunk, parsed));
                    }
                    Err(cause) if attempt >= self.policy.max_attempts() => RetryState::Exhausted {
                        attempts: attempt,
                        cause,
                    },
                    Err(cause) => RetryState::TransientFailure { attempt, cause },
                },
                RetryState::TransientFailure { attempt, cause } => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        service = self.service.name(),
                        language = %language,
                        chunk = chunk.index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        "matching call failed; retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    RetryState::Attempting(attempt + 1)
                }
                RetryState::Exhausted { attempts, cause } => {
                    tracing::error!(
                        service = self.service.name(),
                        language = %language,
                        chunk = chunk.index,
                        attempts,
                        error = %cause,
                        "matching retries exhausted"
                    );
                    return Err(Error::MatchingFailed {
                        language: language.to_string(),
                        chunk: chunk.index,
                        attempts,
                        cause: cause.to_string(),
                    });
                }
            };
        }
    }
}

/// Drop correspondences for URLs outside the chunk and report silently skipped sources as unmatched.
fn align_to_chunk(chunk: &MatchChunk, parsed: ChunkMatch) -> ChunkMatch {
    let sources: HashSet<&str> = chunk.source_urls.iter().map(String::as_str).collect();

    let mut accepted = Vec::with_capacity(parsed.accepted.len());
    for c in parsed.accepted {
        if sources.contains(c.source.as_str()) {
            accepted.push(c);
        } else {
            tracing::warn!(source = %c.source, chunk = chunk.index, "dropping correspondence for unknown source");
        }
    }
    let matched: HashSet<&str> = accepted.iter().map(|c| c.source.as_str()).collect();

    let mut seen = HashSet::new();
    let mut unmatched = Vec::new();
    for u in parsed.explicitly_unmatched {
        if sources.contains(u.as_str()) && !matched.contains(u.as_str()) && seen.insert(u.clone()) {
            unmatched.push(u);
        }
    }
    for s in &chunk.source_urls {
        if !matched.contains(s.as_str()) && seen.insert(s.clone()) {
            tracing::debug!(source = %s, chunk = chunk.index, "source omitted by service; treating as unmatched");
            unmatched.push(s.clone());
        }
    }

    ChunkMatch {
        accepted,
        explicitly_unmatched: unmatched,
    }
}

/// Remove markdown code-fence lines (```json ... ```) around a model answer.
pub fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Deserialize)]
struct RawCorrespondence {
    #[serde(alias = "source")]
    old: String,
    #[serde(alias = "target")]
    new: String,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
    #[serde(default)]
    reason: Option<String>,
}

fn confidence_value(v: Option<&serde_json::Value>) -> f64 {
    let c = match v {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}

/// Parse `{"correspondences": [...], "unmatched": [...]}`; both fields are required.
pub fn parse_match_response(raw: &str) -> Result<ChunkMatch> {
    let cleaned = strip_code_fence(raw);
    let v: serde_json::Value = serde_json::from_str(&cleaned)
        .map_err(|e| Error::InvalidInput(format!("response is not JSON: {e}")))?;
    let obj = v
        .as_object()
        .ok_or_else(|| Error::InvalidInput("response is not a JSON object".to_string()))?;
    let (Some(corr), Some(unmatched)) = (obj.get("correspondences"), obj.get("unmatched")) else {
        return Err(Error::InvalidInput(
            "response must contain `correspondences` and `unmatched`".to_string(),
        ));
    };

    let raw_corr: Vec<RawCorrespondence> = serde_json::from_value(corr.clone())
        .map_err(|e| Error::InvalidInput(format!("invalid `correspondences`: {e}")))?;
    let unmatched: Vec<String> = serde_json::from_value(unmatched.clone())
        .map_err(|e| Error::InvalidInput(format!("invalid `unmatched`: {e}")))?;

    let accepted = raw_corr
        .into_iter()
        .map(|c| MatchCandidate {
            confidence: confidence_value(c.confidence.as_ref()),
            source: c.old.trim().to_string(),
            target: c.new.trim().to_string(),
            reason: c.reason.unwrap_or_default(),
        })
        .collect();

    Ok(ChunkMatch {
        accepted,
        explicitly_unmatched: unmatched.into_iter().map(|u| u.trim().to_string()).collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

pub fn match_stats(candidates: &[MatchCandidate]) -> MatchStats {
    if candidates.is_empty() {
        return MatchStats {
            mean: 0.0,
            min: 0.0,
            max: 0.0,
        };
    }
    let (sum, min, max) = candidates.iter().fold(
        (0.0, f64::INFINITY, f64::NEG_INFINITY),
        |(s, lo, hi), c| (s + c.confidence, lo.min(c.confidence), hi.max(c.confidence)),
    );
    MatchStats {
        mean: sum / candidates.len() as f64,
        min,
        max,
    }
}

/// USD per 1k tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_1k: 0.0015,
            output_per_1k: 0.002,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub usd: f64,
}

/// Rough estimate: 4 chars per token, ~1000 chars of prompt overhead, ~50 output tokens per source.
pub fn estimate_cost(
    old_urls: &[String],
    new_urls: &[String],
    business_context: &str,
    pricing: Pricing,
) -> CostEstimate {
    let chars: usize = old_urls.iter().chain(new_urls).map(String::len).sum::<usize>()
        + business_context.len()
        + 1_000;
    let input_tokens = (chars / 4) as u64;
    let output_tokens = old_urls.len() as u64 * 50;
    let usd = input_tokens as f64 / 1_000.0 * pricing.input_per_1k
        + output_tokens as f64 / 1_000.0 * pricing.output_per_1k;
    CostEstimate {
        input_tokens,
        output_tokens,
        usd: (usd * 10_000.0).round() / 10_000.0,
    }
}
