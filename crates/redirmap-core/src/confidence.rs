use crate::MatchCandidate;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutcome {
    pub accepted: Vec<MatchCandidate>,
    /// Sources of candidates below the threshold; handled like explicitly unmatched URLs.
    pub rejected: Vec<String>,
}

/// Partition candidates on `threshold` (inclusive).
pub fn filter(candidates: Vec<MatchCandidate>, threshold: f64) -> FilterOutcome {
    let mut out = FilterOutcome::default();
    for c in candidates {
        if c.confidence >= threshold {
            out.accepted.push(c);
        } else {
            out.rejected.push(c.source);
        }
    }
    out
}
