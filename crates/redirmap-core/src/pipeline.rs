//! End-to-end run: classify, match per language, fall back, reconcile.

use crate::cache::{CacheKey, CachePolicy, MatchSnapshot, ResultCache};
use crate::matching::RetryPolicy;
use crate::{
    chunk, filter, AmbiguousSource, ChunkMatch, Error, FallbackRedirect, FallbackResolver,
    LanguageClassifier, LanguageCoverage, LanguageTag, MatchCandidate, MatchService,
    PipelineConfig, RedirectRecord, Result, SemanticMatchClient,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// A language whose matching stopped on an exhausted or unparseable chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageFailure {
    pub language: LanguageTag,
    pub chunk: usize,
    pub attempts: u32,
    pub message: String,
    /// Old URLs of this language that never got an answer (the failed chunk and everything after it).
    pub unprocessed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    /// Final redirect set, one per source.
    pub records: Vec<RedirectRecord>,
    /// Correspondences at or above the threshold.
    pub matches: Vec<MatchCandidate>,
    pub fallbacks: Vec<FallbackRedirect>,
    /// Old URLs that ended up without a confident match in a migrated language.
    pub unmatched: Vec<String>,
    pub missing_languages: Vec<LanguageTag>,
    pub languages_processed: Vec<LanguageTag>,
    /// Languages answered from the cache instead of the service.
    pub languages_cached: Vec<LanguageTag>,
    pub failures: Vec<LanguageFailure>,
    pub ambiguous: Vec<AmbiguousSource>,
    pub coverage: Option<LanguageCoverage>,
}

impl PipelineOutcome {
    pub fn permanent_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == crate::RedirectStatus::Permanent)
            .count()
    }

    pub fn temporary_count(&self) -> usize {
        self.records.len() - self.permanent_count()
    }
}

pub struct Pipeline<S> {
    config: PipelineConfig,
    classifier: LanguageClassifier,
    resolver: FallbackResolver,
    client: SemanticMatchClient<S>,
    cache: Option<(Arc<dyn ResultCache>, CachePolicy)>,
}

impl<S: MatchService> Pipeline<S> {
    pub fn new(config: PipelineConfig, service: S) -> Result<Self> {
        config.validate()?;
        let classifier = LanguageClassifier::new(config.default_language.clone());
        let resolver = build_resolver(&config, classifier.clone());
        let policy = RetryPolicy {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
        };
        let client = SemanticMatchClient::new(service, policy).with_temperature(config.temperature);
        Ok(Self {
            config,
            classifier,
            resolver,
            client,
            cache: None,
        })
    }

    /// Replace the classifier (e.g. one carrying extra rules). Its default language wins
    /// over `config.default_language`.
    pub fn with_classifier(mut self, classifier: LanguageClassifier) -> Self {
        self.resolver = build_resolver(&self.config, classifier.clone());
        self.classifier = classifier;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>, policy: CachePolicy) -> Self {
        self.cache = Some((cache, policy));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn classifier(&self) -> &LanguageClassifier {
        &self.classifier
    }

    pub fn resolver(&self) -> &FallbackResolver {
        &self.resolver
    }

    /// Run the whole mapping. Per-language matching failures do not abort the run; they are
    /// reported in [`PipelineOutcome::failures`] next to everything that did succeed.
    pub async fn run(&self, old_urls: &[String], new_urls: &[String]) -> Result<PipelineOutcome> {
        let key = CacheKey::derive(
            old_urls,
            new_urls,
            self.config.business_context(),
            self.config.temperature,
        );
        let cached = self.read_cache(&key);

        let old_group = self.classifier.group_by_language(old_urls);
        let new_group = self.classifier.group_by_language(new_urls);
        let fallback_lang = &self.config.fallback_language;

        let coverage = LanguageCoverage::compute(&old_group, &new_group, fallback_lang);
        let mut fallbacks =
            self.resolver
                .resolve_missing_languages(&old_group, &new_group, fallback_lang);

        let mut outcome = PipelineOutcome {
            missing_languages: coverage.missing_languages.clone(),
            ..PipelineOutcome::default()
        };
        let mut snapshot = MatchSnapshot::default();

        for (lang, old_bucket) in &old_group {
            let Some(new_bucket) = new_group.get(lang).filter(|b| !b.is_empty()) else {
                continue;
            };
            if old_bucket.is_empty() {
                continue;
            }

            let hit = cached
                .as_ref()
                .and_then(|s| s.languages.get(lang))
                .and_then(|hit| {
                    let fitted = fit_cached(hit, old_bucket);
                    if fitted.is_none() {
                        tracing::info!(language = %lang, "cached matches do not cover this language; matching again");
                    }
                    fitted
                });
            let raw = match hit {
                Some(hit) => {
                    tracing::info!(language = %lang, "using cached matches");
                    outcome.languages_cached.push(lang.clone());
                    snapshot.languages.insert(lang.clone(), hit.clone());
                    hit.clone()
                }
                None => {
                    tracing::info!(
                        language = %lang,
                        old = old_bucket.len(),
                        new = new_bucket.len(),
                        "matching language"
                    );
                    let (partial, failure) = self.match_language(lang, old_bucket, new_bucket).await?;
                    match failure {
                        Some(f) => outcome.failures.push(f),
                        None => {
                            snapshot.languages.insert(lang.clone(), partial.clone());
                        }
                    }
                    partial
                }
            };

            let filtered = filter(raw.accepted, self.config.confidence_threshold);
            outcome.matches.extend(filtered.accepted);
            outcome.unmatched.extend(raw.explicitly_unmatched);
            outcome.unmatched.extend(filtered.rejected);
            outcome.languages_processed.push(lang.clone());
        }

        fallbacks.extend(self.resolver.resolve_unmatched(&outcome.unmatched, fallback_lang));
        let reconciled = crate::reconcile_report(&outcome.matches, &fallbacks);
        outcome.fallbacks = fallbacks;
        outcome.records = reconciled.records;
        outcome.ambiguous = reconciled.ambiguous;
        outcome.coverage = Some(coverage);

        if outcome.failures.is_empty() && outcome.languages_cached.len() < snapshot.languages.len() {
            self.write_cache(&key, &snapshot);
        }

        tracing::info!(
            records = outcome.records.len(),
            permanent = outcome.permanent_count(),
            temporary = outcome.temporary_count(),
            failures = outcome.failures.len(),
            "mapping complete"
        );
        Ok(outcome)
    }

    /// Match every chunk of one language in order. Stops at the first failed chunk, returning
    /// what earlier chunks produced together with the failure.
    async fn match_language(
        &self,
        lang: &LanguageTag,
        old_bucket: &[String],
        new_bucket: &[String],
    ) -> Result<(ChunkMatch, Option<LanguageFailure>)> {
        let chunks = chunk(
            old_bucket,
            new_bucket,
            self.config.chunk_size,
            self.config.max_candidates_per_chunk,
        )?;
        let total = chunks.len();
        let mut merged = ChunkMatch::default();

        for c in &chunks {
            tracing::debug!(language = %lang, chunk = c.index, of = total, "matching chunk");
            match self
                .client
                .match_chunk(c, self.config.business_context(), lang)
                .await
            {
                Ok(m) => {
                    merged.accepted.extend(m.accepted);
                    merged.explicitly_unmatched.extend(m.explicitly_unmatched);
                }
                Err(Error::MatchingFailed {
                    chunk,
                    attempts,
                    cause,
                    ..
                }) => {
                    let unprocessed = chunks[c.index..]
                        .iter()
                        .flat_map(|c| c.source_urls.iter().cloned())
                        .collect();
                    let failure = LanguageFailure {
                        language: lang.clone(),
                        chunk,
                        attempts,
                        message: cause,
                        unprocessed,
                    };
                    return Ok((merged, Some(failure)));
                }
                Err(e) => return Err(e),
            }
        }
        Ok((merged, None))
    }

    fn read_cache(&self, key: &CacheKey) -> Option<MatchSnapshot> {
        let (cache, policy) = self.cache.as_ref()?;
        if !policy.read {
            return None;
        }
        match cache.get(key) {
            Ok(hit) => {
                tracing::debug!(key = %key, hit = hit.is_some(), "cache lookup");
                hit
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache read failed; matching without it");
                None
            }
        }
    }

    fn write_cache(&self, key: &CacheKey, snapshot: &MatchSnapshot) {
        let Some((cache, policy)) = self.cache.as_ref() else {
            return;
        };
        if !policy.write {
            return;
        }
        if let Err(e) = cache.put(key, snapshot) {
            tracing::warn!(key = %key, error = %e, "cache write failed");
        }
    }
}

/// Restrict a cached language result to the current bucket. Sources that left the bucket are
/// dropped; `None` when a bucket source has no cached answer.
fn fit_cached(hit: &ChunkMatch, old_bucket: &[String]) -> Option<ChunkMatch> {
    let bucket: HashSet<&str> = old_bucket.iter().map(String::as_str).collect();
    let accepted: Vec<MatchCandidate> = hit
        .accepted
        .iter()
        .filter(|c| bucket.contains(c.source.as_str()))
        .cloned()
        .collect();
    let explicitly_unmatched: Vec<String> = hit
        .explicitly_unmatched
        .iter()
        .filter(|u| bucket.contains(u.as_str()))
        .cloned()
        .collect();

    let answered: HashSet<&str> = accepted
        .iter()
        .map(|c| c.source.as_str())
        .chain(explicitly_unmatched.iter().map(String::as_str))
        .collect();
    if old_bucket.iter().any(|s| !answered.contains(s.as_str())) {
        return None;
    }
    Some(ChunkMatch {
        accepted,
        explicitly_unmatched,
    })
}

fn build_resolver(config: &PipelineConfig, classifier: LanguageClassifier) -> FallbackResolver {
    FallbackResolver::new(classifier)
        .with_target_domain(config.target_domain.clone())
        .with_root_language(config.root_language.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MatchRequest, RedirectStatus};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers from a canned table keyed by language; languages listed in `broken` always fail.
    struct Scripted {
        answers: HashMap<&'static str, &'static str>,
        broken: Vec<&'static str>,
        /// Every call from this (0-based) index on fails.
        fail_from: Option<usize>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: &[(&'static str, &'static str)]) -> Self {
            Self {
                answers: answers.iter().copied().collect(),
                broken: Vec::new(),
                fail_from: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl MatchService for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn complete(&self, req: &MatchRequest) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let lang = req.language.as_str();
            if self.fail_from.is_some_and(|from| n >= from) {
                return Err(Error::Llm(format!("call {n} refused")));
            }
            if self.broken.iter().any(|b| *b == lang) {
                return Err(Error::Llm(format!("{lang} backend down")));
            }
            Ok(self
                .answers
                .get(lang)
                .copied()
                .unwrap_or(r#"{"correspondences": [], "unmatched": []}"#)
                .to_string())
        }
    }

    #[derive(Default)]
    struct MemCache {
        entries: Mutex<HashMap<String, MatchSnapshot>>,
    }

    impl ResultCache for MemCache {
        fn get(&self, key: &CacheKey) -> Result<Option<MatchSnapshot>> {
            Ok(self.entries.lock().unwrap().get(key.as_str()).cloned())
        }

        fn put(&self, key: &CacheKey, snapshot: &MatchSnapshot) -> Result<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.as_str().to_string(), snapshot.clone());
            Ok(())
        }
    }

    fn strings(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            retry_base_delay_ms: 0,
            max_retries: 1,
            ..PipelineConfig::default()
        }
    }

    const FR_ANSWER: &str = r#"{
        "correspondences": [
            {"old": "/fr/contact", "new": "/fr/nous-contacter", "confidence": 0.9, "reason": "same page"},
            {"old": "/fr/chambres", "new": "/fr/nos-chambres", "confidence": 0.85, "reason": "rooms"}
        ],
        "unmatched": []
    }"#;

    #[tokio::test]
    async fn end_to_end_mixes_matches_and_missing_language_fallbacks() {
        let answer = r#"{
            "correspondences": [
                {"old": "/fr/accueil", "new": "/fr/home", "confidence": 0.9, "reason": "home page"},
                {"old": "/fr/contact", "new": "/fr/contact-us", "confidence": 0.85, "reason": "contact"}
            ],
            "unmatched": []
        }"#;
        let old = strings(&["/fr/accueil", "/fr/contact", "/es/inicio"]);
        let new = strings(&["/fr/home", "/fr/contact-us"]);
        let p = Pipeline::new(fast_config(), Scripted::new(&[("fr", answer)])).unwrap();

        let out = p.run(&old, &new).await.unwrap();
        assert_eq!(out.records.len(), 3);
        assert!(out.records.iter().all(|r| r.source != r.target));
        assert_eq!(out.permanent_count(), 2);
        assert_eq!(out.matches.len(), 2);
        assert_eq!(out.missing_languages, vec![LanguageTag::new("es")]);

        let es = out.records.iter().find(|r| r.source == "/es/inicio").unwrap();
        assert_eq!(es.status, RedirectStatus::Temporary);
        assert_eq!(es.target, "/fr/");
        assert_eq!(es.confidence, 0.0);

        let contact = out.records.iter().find(|r| r.source == "/fr/contact").unwrap();
        assert_eq!(contact.target, "/fr/contact-us");
        assert_eq!(contact.confidence, 0.85);
        assert_eq!(out.languages_processed, vec![LanguageTag::new("fr")]);
        assert!(out.failures.is_empty());
        assert_eq!(out.coverage.as_ref().map(|c| c.fallback_count), Some(1));
    }

    #[tokio::test]
    async fn low_confidence_and_omitted_sources_become_fallbacks() {
        let answer = r#"{
            "correspondences": [{"old": "/en/rooms", "new": "/en/our-rooms", "confidence": 0.4, "reason": "weak"}],
            "unmatched": []
        }"#;
        let old = strings(&["/en/rooms", "/en/forgotten"]);
        let new = strings(&["/en/our-rooms"]);
        let p = Pipeline::new(fast_config(), Scripted::new(&[("en", answer)])).unwrap();

        let out = p.run(&old, &new).await.unwrap();
        assert!(out.matches.is_empty());
        assert_eq!(out.unmatched.len(), 2);
        assert!(out
            .records
            .iter()
            .all(|r| r.status == RedirectStatus::Temporary && r.target == "/en/"));
    }

    #[tokio::test]
    async fn one_failing_language_does_not_sink_the_others() {
        let en_answer = r#"{
            "correspondences": [{"old": "/en/contact", "new": "/en/contact-us", "confidence": 0.95, "reason": "same"}],
            "unmatched": []
        }"#;
        let mut svc = Scripted::new(&[("en", en_answer), ("fr", FR_ANSWER)]);
        svc.broken.push("de");
        let old = strings(&["/de/kontakt", "/en/contact", "/fr/contact"]);
        let new = strings(&["/de/kontakt-neu", "/en/contact-us", "/fr/nous-contacter"]);
        let p = Pipeline::new(fast_config(), svc).unwrap();

        let out = p.run(&old, &new).await.unwrap();
        assert_eq!(out.failures.len(), 1);
        let f = &out.failures[0];
        assert_eq!(f.language, LanguageTag::new("de"));
        assert_eq!(f.attempts, 2);
        assert_eq!(f.unprocessed, strings(&["/de/kontakt"]));

        assert!(out.records.iter().any(|r| r.source == "/en/contact"));
        assert!(out.records.iter().any(|r| r.source == "/fr/contact"));
        assert!(!out.records.iter().any(|r| r.source == "/de/kontakt"));
        // Two attempts for de, one each for en and fr.
        assert_eq!(p.client.service().calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cached_snapshot_skips_the_service() {
        let old = strings(&["/fr/contact", "/fr/chambres"]);
        let new = strings(&["/fr/nous-contacter", "/fr/nos-chambres"]);
        let cache = Arc::new(MemCache::default());

        let p = Pipeline::new(fast_config(), Scripted::new(&[("fr", FR_ANSWER)]))
            .unwrap()
            .with_cache(cache.clone(), CachePolicy::default());
        let first = p.run(&old, &new).await.unwrap();
        assert!(first.languages_cached.is_empty());
        assert_eq!(cache.entries.lock().unwrap().len(), 1);

        // Reordered input maps to the same key.
        let old_rev: Vec<String> = old.iter().rev().cloned().collect();
        let second = p.run(&old_rev, &new).await.unwrap();
        assert_eq!(second.languages_cached, vec![LanguageTag::new("fr")]);
        assert_eq!(p.client.service().calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.matches, first.matches);
    }

    #[tokio::test]
    async fn failure_mid_language_keeps_earlier_chunks() {
        let de_answer = r#"{
            "correspondences": [
                {"old": "/de/a", "new": "/de/a-neu", "confidence": 0.9, "reason": "same"},
                {"old": "/de/b", "new": "/de/b-neu", "confidence": 0.9, "reason": "same"},
                {"old": "/de/c", "new": "/de/c-neu", "confidence": 0.9, "reason": "same"}
            ],
            "unmatched": []
        }"#;
        let mut svc = Scripted::new(&[("de", de_answer)]);
        svc.fail_from = Some(1);
        let cfg = PipelineConfig {
            chunk_size: 1,
            ..fast_config()
        };
        let p = Pipeline::new(cfg, svc).unwrap();

        let old = strings(&["/de/a", "/de/b", "/de/c"]);
        let new = strings(&["/de/a-neu", "/de/b-neu", "/de/c-neu"]);
        let out = p.run(&old, &new).await.unwrap();

        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].source, "/de/a");
        assert_eq!(out.records[0].status, RedirectStatus::Permanent);
        assert_eq!(out.failures.len(), 1);
        let f = &out.failures[0];
        assert_eq!(f.chunk, 1);
        assert_eq!(f.attempts, 2);
        assert_eq!(f.unprocessed, strings(&["/de/b", "/de/c"]));
        // No fallbacks for what was never answered.
        assert!(out.fallbacks.is_empty());
    }

    #[tokio::test]
    async fn cached_language_rematched_when_grouping_changes() {
        let en_answer = r#"{
            "correspondences": [{"old": "/contact", "new": "/contact-us", "confidence": 0.9, "reason": "same"}],
            "unmatched": []
        }"#;
        let fr_answer = r#"{
            "correspondences": [
                {"old": "/fr/a", "new": "/fr/b", "confidence": 0.9, "reason": "same"},
                {"old": "/contact", "new": "/contact-us", "confidence": 0.9, "reason": "same"}
            ],
            "unmatched": []
        }"#;
        let old = strings(&["/contact", "/fr/a"]);
        let new = strings(&["/contact-us", "/fr/b"]);
        let cache = Arc::new(MemCache::default());

        let en_default = PipelineConfig {
            default_language: LanguageTag::new("en"),
            ..fast_config()
        };
        let first = Pipeline::new(en_default, Scripted::new(&[("en", en_answer), ("fr", fr_answer)]))
            .unwrap()
            .with_cache(cache.clone(), CachePolicy::default());
        let out = first.run(&old, &new).await.unwrap();
        assert_eq!(out.records.len(), 2);

        // Unprefixed URLs now land in the fr bucket, which the cache only partly answers.
        let fr_default = PipelineConfig {
            default_language: LanguageTag::new("fr"),
            ..fast_config()
        };
        let second = Pipeline::new(fr_default, Scripted::new(&[("fr", fr_answer)]))
            .unwrap()
            .with_cache(cache.clone(), CachePolicy::default());
        let out = second.run(&old, &new).await.unwrap();
        assert!(out.languages_cached.is_empty());
        assert_eq!(second.client.service().calls.load(Ordering::SeqCst), 1);
        for source in &old {
            assert!(
                out.records.iter().any(|r| &r.source == source),
                "{source} has no redirect"
            );
        }
    }

    #[test]
    fn cached_result_is_restricted_to_the_current_bucket() {
        let hit = ChunkMatch {
            accepted: vec![MatchCandidate {
                source: "/contact".to_string(),
                target: "/contact-us".to_string(),
                confidence: 0.9,
                reason: "same".to_string(),
            }],
            explicitly_unmatched: strings(&["/fr/old"]),
        };
        let fitted = fit_cached(&hit, &strings(&["/fr/old"])).unwrap();
        assert!(fitted.accepted.is_empty());
        assert_eq!(fitted.explicitly_unmatched, strings(&["/fr/old"]));

        assert!(fit_cached(&hit, &strings(&["/fr/old", "/fr/new-source"])).is_none());
    }

    #[tokio::test]
    async fn failed_runs_are_not_cached() {
        let mut svc = Scripted::new(&[]);
        svc.broken.push("fr");
        let cache = Arc::new(MemCache::default());
        let p = Pipeline::new(fast_config(), svc)
            .unwrap()
            .with_cache(cache.clone(), CachePolicy::default());

        let out = p
            .run(&strings(&["/fr/a"]), &strings(&["/fr/b"]))
            .await
            .unwrap();
        assert_eq!(out.failures.len(), 1);
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let cfg = PipelineConfig {
            chunk_size: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            Pipeline::new(cfg, Scripted::new(&[])),
            Err(Error::InvalidInput(_))
        ));
    }
}
