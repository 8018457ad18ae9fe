use crate::{FallbackRedirect, MatchCandidate, RedirectRecord, RedirectStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Two distinct targets proposed for one source with the same non-zero confidence.
/// The first-seen target is kept; the other is reported here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousSource {
    pub source: String,
    pub kept_target: String,
    pub dropped_target: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reconciled {
    pub records: Vec<RedirectRecord>,
    pub ambiguous: Vec<AmbiguousSource>,
}

/// One record per source: highest confidence wins, ties keep the first seen,
/// self-redirects are dropped. Output follows first-seen order of each source.
pub fn reconcile_records(records: impl IntoIterator<Item = RedirectRecord>) -> Reconciled {
    let mut out: Vec<RedirectRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut ambiguous = Vec::new();

    for rec in records {
        if rec.source == rec.target {
            tracing::debug!(source = %rec.source, "dropping self-redirect");
            continue;
        }
        match index.get(&rec.source) {
            None => {
                index.insert(rec.source.clone(), out.len());
                out.push(rec);
            }
            Some(&i) => {
                let kept = &mut out[i];
                if rec.confidence > kept.confidence {
                    *kept = rec;
                } else if rec.confidence == kept.confidence
                    && rec.confidence > 0.0
                    && rec.target != kept.target
                {
                    tracing::warn!(
                        source = %rec.source,
                        kept = %kept.target,
                        dropped = %rec.target,
                        confidence = rec.confidence,
                        "equal-confidence matches for one source; keeping the first"
                    );
                    ambiguous.push(AmbiguousSource {
                        source: rec.source,
                        kept_target: kept.target.clone(),
                        dropped_target: rec.target,
                        confidence: rec.confidence,
                    });
                }
            }
        }
    }

    Reconciled {
        records: out,
        ambiguous,
    }
}

fn candidate_records<'a>(
    matches: &'a [MatchCandidate],
    fallbacks: &'a [FallbackRedirect],
) -> impl Iterator<Item = RedirectRecord> + 'a {
    let m = matches.iter().map(|c| RedirectRecord {
        source: c.source.clone(),
        target: c.target.clone(),
        status: RedirectStatus::Permanent,
        confidence: c.confidence,
        reason: c.reason.clone(),
    });
    let f = fallbacks.iter().map(|f| RedirectRecord {
        source: f.source.clone(),
        target: f.target.clone(),
        status: RedirectStatus::Temporary,
        confidence: 0.0,
        reason: f.note.clone(),
    });
    m.chain(f)
}

/// Merge semantic matches (301) and fallbacks (302) into one redirect per source.
pub fn reconcile(matches: &[MatchCandidate], fallbacks: &[FallbackRedirect]) -> Vec<RedirectRecord> {
    reconcile_records(candidate_records(matches, fallbacks)).records
}

/// Like [`reconcile`], also reporting equal-confidence conflicts.
pub fn reconcile_report(matches: &[MatchCandidate], fallbacks: &[FallbackRedirect]) -> Reconciled {
    reconcile_records(candidate_records(matches, fallbacks))
}
