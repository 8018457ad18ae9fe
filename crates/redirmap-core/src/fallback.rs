//! Temporary redirects for URLs the matcher could not place.
//!
//! Two independent causes: a whole language absent from the new site, and single
//! orphaned pages inside a migrated language.

use crate::language::missing_in;
use crate::{FallbackKind, FallbackRedirect, LanguageClassifier, LanguageTag, UrlGroup};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct FallbackResolver {
    classifier: LanguageClassifier,
    target_domain: Option<String>,
    root_language: Option<LanguageTag>,
}

impl FallbackResolver {
    pub fn new(classifier: LanguageClassifier) -> Self {
        Self {
            classifier,
            target_domain: None,
            root_language: None,
        }
    }

    /// Compose absolute targets under `domain` instead of bare paths.
    pub fn with_target_domain(mut self, domain: Option<String>) -> Self {
        self.target_domain = domain
            .map(|d| d.trim().trim_end_matches('/').to_string())
            .filter(|d| !d.is_empty());
        self
    }

    /// Language whose home page is the site root.
    pub fn with_root_language(mut self, tag: Option<LanguageTag>) -> Self {
        self.root_language = tag;
        self
    }

    /// Landing page for `tag`: `/xx/`, `{domain}/xx/`, or the root for the root language.
    pub fn language_home(&self, tag: &LanguageTag) -> String {
        let at_root = self.root_language.as_ref() == Some(tag);
        match (&self.target_domain, at_root) {
            (Some(d), true) => format!("{d}/"),
            (Some(d), false) => format!("{d}/{tag}/"),
            (None, true) => "/".to_string(),
            (None, false) => format!("/{tag}/"),
        }
    }

    pub fn resolve_missing_languages(
        &self,
        old_group: &UrlGroup,
        new_group: &UrlGroup,
        fallback_lang: &LanguageTag,
    ) -> Vec<FallbackRedirect> {
        let target = self.language_home(fallback_lang);
        let mut out = Vec::new();
        for tag in missing_in(old_group, new_group) {
            let urls = old_group.get(&tag).map(Vec::as_slice).unwrap_or_default();
            tracing::info!(language = %tag, urls = urls.len(), target = %target, "language missing on new site");
            out.extend(urls.iter().map(|url| FallbackRedirect {
                source: url.clone(),
                target: target.clone(),
                kind: FallbackKind::MissingLanguage,
                note: format!("language {tag} not migrated; temporary redirect to {fallback_lang}"),
            }));
        }
        out
    }

    pub fn resolve_unmatched(
        &self,
        unmatched_urls: &[String],
        fallback_lang: &LanguageTag,
    ) -> Vec<FallbackRedirect> {
        unmatched_urls
            .iter()
            .map(|url| {
                let lang = self
                    .classifier
                    .detect_explicit(url)
                    .unwrap_or_else(|| fallback_lang.clone());
                FallbackRedirect {
                    source: url.clone(),
                    target: self.language_home(&lang),
                    kind: FallbackKind::Unmatched,
                    note: "no confident match; temporary redirect, review manually".to_string(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageDetail {
    pub old_count: usize,
    pub new_count: usize,
    pub missing: bool,
    pub fallback_needed: usize,
}

/// Per-language migration coverage of an old/new URL pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageCoverage {
    pub total_old_urls: usize,
    pub total_new_urls: usize,
    pub languages_old: usize,
    pub languages_new: usize,
    pub missing_languages: Vec<LanguageTag>,
    pub fallback_language: LanguageTag,
    pub fallback_count: usize,
    /// Share of old URLs needing a missing-language fallback, one decimal.
    pub fallback_percentage: f64,
    pub details: BTreeMap<LanguageTag, LanguageDetail>,
}

impl LanguageCoverage {
    pub fn compute(old_group: &UrlGroup, new_group: &UrlGroup, fallback_lang: &LanguageTag) -> Self {
        let missing = missing_in(old_group, new_group);
        let total_old: usize = old_group.values().map(Vec::len).sum();
        let total_new: usize = new_group.values().map(Vec::len).sum();

        let mut details = BTreeMap::new();
        let mut fallback_count = 0;
        for (tag, urls) in old_group {
            let is_missing = missing.contains(tag);
            let fallback_needed = if is_missing { urls.len() } else { 0 };
            fallback_count += fallback_needed;
            details.insert(
                tag.clone(),
                LanguageDetail {
                    old_count: urls.len(),
                    new_count: new_group.get(tag).map_or(0, Vec::len),
                    missing: is_missing,
                    fallback_needed,
                },
            );
        }

        let fallback_percentage = if total_old == 0 {
            0.0
        } else {
            (fallback_count as f64 / total_old as f64 * 1_000.0).round() / 10.0
        };

        Self {
            total_old_urls: total_old,
            total_new_urls: total_new,
            languages_old: old_group.len(),
            languages_new: new_group.values().filter(|v| !v.is_empty()).count(),
            missing_languages: missing,
            fallback_language: fallback_lang.clone(),
            fallback_count,
            fallback_percentage,
            details,
        }
    }
}
