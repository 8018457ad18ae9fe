//! URL language classification.
//!
//! Rules are checked in order; the first language with any matching pattern wins.
//! Every pattern is anchored on a slash, dot, hyphen, scheme or end-of-string boundary,
//! so tag-like substrings inside words ("friend", "english") never fire.

use crate::{Error, LanguageTag, Result, UrlGroup};
use regex::Regex;
use std::collections::BTreeMap;

/// Built-in languages, in priority order.
pub const BUILTIN_LANGUAGES: &[&str] = &["fr", "en", "de", "es", "it", "nl"];

/// Second-level domains accepted after an `xx.` language subdomain.
const SIBLING_DOMAIN_TOKENS: &str = "com|net|org|eu";

#[derive(Debug, Clone)]
struct LanguageRule {
    tag: LanguageTag,
    patterns: Vec<Regex>,
}

#[derive(Debug, Clone)]
pub struct LanguageClassifier {
    default_language: LanguageTag,
    rules: Vec<LanguageRule>,
}

fn builtin_patterns(tag: &str) -> Vec<String> {
    let t = regex::escape(tag);
    let mut out = vec![
        // /path/xx/contact
        format!("/{t}/"),
        // /contact/xx
        format!("/{t}(?:[?#]|$)"),
        // /contact-xx.html, /kontakt-xx
        format!("-{t}(?:[./?#]|$)"),
        // example.xx/page
        format!(r"\.{t}(?:[/:?#]|$)"),
        // xx.example.com/page
        format!(
            r"^(?:[a-z][a-z0-9+.-]*://)?{t}\.(?:[a-z0-9-]+\.)*[a-z0-9-]+\.(?:{SIBLING_DOMAIN_TOKENS})(?:[/:?#]|$)"
        ),
    ];
    if tag == "en" {
        out.push(r"\.co\.uk(?:[/:?#]|$)".to_string());
    }
    out
}

impl LanguageClassifier {
    /// Classifier with the built-in rule set and `default_language` as the total-function fallback.
    pub fn new(default_language: impl Into<LanguageTag>) -> Self {
        let rules = BUILTIN_LANGUAGES
            .iter()
            .map(|tag| LanguageRule {
                tag: LanguageTag::new(tag),
                // Built-in sources are generated from escaped tags and always compile.
                patterns: builtin_patterns(tag)
                    .iter()
                    .filter_map(|p| Regex::new(p).ok())
                    .collect(),
            })
            .collect();
        Self {
            default_language: default_language.into(),
            rules,
        }
    }

    pub fn default_language(&self) -> &LanguageTag {
        &self.default_language
    }

    /// Append custom patterns for `tag`. Unknown tags are added after the existing rules,
    /// so built-in languages keep their priority.
    pub fn add_rule(&mut self, tag: impl Into<LanguageTag>, patterns: &[&str]) -> Result<()> {
        let tag = tag.into();
        if tag.as_str().is_empty() {
            return Err(Error::InvalidInput("language tag must not be empty".to_string()));
        }
        let mut compiled = Vec::with_capacity(patterns.len());
        for p in patterns {
            let re = Regex::new(p)
                .map_err(|e| Error::InvalidInput(format!("invalid pattern for {tag}: {e}")))?;
            compiled.push(re);
        }
        match self.rules.iter_mut().find(|r| r.tag == tag) {
            Some(rule) => rule.patterns.extend(compiled),
            None => self.rules.push(LanguageRule {
                tag,
                patterns: compiled,
            }),
        }
        Ok(())
    }

    /// Rule-based detection only; `None` when no configured language matches.
    pub fn detect_explicit(&self, url: &str) -> Option<LanguageTag> {
        let url = url.trim().to_lowercase();
        if url.is_empty() {
            return None;
        }
        self.rules
            .iter()
            .find(|rule| rule.patterns.iter().any(|re| re.is_match(&url)))
            .map(|rule| rule.tag.clone())
    }

    /// Always returns a tag: the first matching rule, else the default language.
    pub fn detect(&self, url: &str) -> LanguageTag {
        self.detect_explicit(url)
            .unwrap_or_else(|| self.default_language.clone())
    }

    pub fn group_by_language(&self, urls: &[String]) -> UrlGroup {
        let mut groups = UrlGroup::new();
        for url in urls {
            groups.entry(self.detect(url)).or_default().push(url.clone());
        }
        groups
    }

    pub fn language_stats(&self, urls: &[String]) -> BTreeMap<LanguageTag, usize> {
        let mut stats = BTreeMap::new();
        for url in urls {
            *stats.entry(self.detect(url)).or_insert(0) += 1;
        }
        stats
    }

    /// Languages present in `old_urls` but absent from `new_urls`, sorted.
    pub fn missing_languages(&self, old_urls: &[String], new_urls: &[String]) -> Vec<LanguageTag> {
        let old = self.group_by_language(old_urls);
        let new = self.group_by_language(new_urls);
        missing_in(&old, &new)
    }

    pub fn supported_languages(&self) -> Vec<LanguageTag> {
        let mut tags: Vec<LanguageTag> = self.rules.iter().map(|r| r.tag.clone()).collect();
        tags.sort();
        tags
    }
}

impl Default for LanguageClassifier {
    fn default() -> Self {
        Self::new("fr")
    }
}

/// Tags keyed in `old` whose bucket in `new` is absent or empty.
pub fn missing_in(old: &UrlGroup, new: &UrlGroup) -> Vec<LanguageTag> {
    old.keys()
        .filter(|tag| new.get(*tag).map_or(true, |urls| urls.is_empty()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tag(s: &str) -> LanguageTag {
        LanguageTag::new(s)
    }

    #[test]
    fn detects_path_prefix() {
        let c = LanguageClassifier::default();
        for url in ["/fr/contact", "/fr/services/camping", "/fr/blog/article-1"] {
            assert_eq!(c.detect(url), tag("fr"), "{url}");
        }
        assert_eq!(c.detect("/es/contacto"), tag("es"));
        assert_eq!(c.detect("/it/contatto"), tag("it"));
        assert_eq!(c.detect("/nl/contact"), tag("nl"));
    }

    #[test]
    fn detects_suffix_hyphen_and_subdomain_forms() {
        let c = LanguageClassifier::default();
        assert_eq!(c.detect("/en/about-us"), tag("en"));
        assert_eq!(c.detect("/contact/en"), tag("en"));
        assert_eq!(c.detect("/contact-en.html"), tag("en"));
        assert_eq!(c.detect("en.example.com/page"), tag("en"));
        assert_eq!(c.detect("https://de.example.com/seite"), tag("de"));
        assert_eq!(c.detect("/kontakt-de"), tag("de"));
        assert_eq!(c.detect("www.site.de/page"), tag("de"));
        assert_eq!(c.detect("https://shop.example.co.uk/basket"), tag("en"));
        assert_eq!(c.detect("https://example.nl"), tag("nl"));
    }

    #[test]
    fn is_case_insensitive() {
        let c = LanguageClassifier::default();
        assert_eq!(c.detect("/DE/Kontakt"), tag("de"));
        assert_eq!(c.detect("  /IT/chi-siamo  "), tag("it"));
    }

    #[test]
    fn does_not_fire_inside_words() {
        let c = LanguageClassifier::new("xx");
        assert_eq!(c.detect("/friend/contact"), tag("xx"));
        assert_eq!(c.detect("/english-lessons"), tag("xx"));
        assert_eq!(c.detect("/contact-free.html"), tag("xx"));
        assert_eq!(c.detect("/desk/items"), tag("xx"));
        assert_eq!(c.detect("https://fresh.example.org/"), tag("xx"));
    }

    #[test]
    fn falls_back_to_default_language() {
        let c = LanguageClassifier::new("en");
        assert_eq!(c.detect("/simple-page"), tag("en"));
        assert_eq!(c.detect(""), tag("en"));
        assert_eq!(c.detect_explicit("/simple-page"), None);
        assert_eq!(c.detect_explicit("/nl/pagina"), Some(tag("nl")));
    }

    #[test]
    fn priority_order_resolves_ambiguity() {
        let c = LanguageClassifier::default();
        // French domain, English path: French rules are checked first.
        assert_eq!(c.detect("https://example.fr/en/page"), tag("fr"));
    }

    #[test]
    fn groups_preserve_order_and_duplicates() {
        let c = LanguageClassifier::default();
        let urls: Vec<String> = ["/fr/accueil", "/en/home", "/fr/contact", "/fr/accueil", "/contact"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let g = c.group_by_language(&urls);
        assert_eq!(
            g[&tag("fr")],
            vec!["/fr/accueil", "/fr/contact", "/fr/accueil", "/contact"]
        );
        assert_eq!(g[&tag("en")], vec!["/en/home"]);
        assert_eq!(g.keys().map(|t| t.as_str()).collect::<Vec<_>>(), vec!["en", "fr"]);

        let stats = c.language_stats(&urls);
        assert_eq!(stats[&tag("fr")], 4);
        assert_eq!(stats[&tag("en")], 1);
    }

    #[test]
    fn missing_languages_are_sorted() {
        let c = LanguageClassifier::default();
        let old: Vec<String> = ["/fr/a", "/nl/b", "/es/c", "/en/d"].iter().map(|s| s.to_string()).collect();
        let new: Vec<String> = ["/fr/x", "/en/y"].iter().map(|s| s.to_string()).collect();
        assert_eq!(c.missing_languages(&old, &new), vec![tag("es"), tag("nl")]);
    }

    #[test]
    fn custom_rules_extend_and_add_languages() {
        let mut c = LanguageClassifier::new("fr");
        c.add_rule("pt", &["/pt-br/", r"\.pt(?:/|$)"]).unwrap();
        c.add_rule("en", &["/english/"]).unwrap();
        assert_eq!(c.detect("/pt-br/contato"), tag("pt"));
        assert_eq!(c.detect("/english/about"), tag("en"));
        assert!(c.supported_languages().contains(&tag("pt")));

        let err = c.add_rule("ru", &["(unclosed"]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    proptest! {
        #[test]
        fn detect_is_total_and_pure(url in ".{0,80}") {
            let c = LanguageClassifier::new("zz");
            let a = c.detect(&url);
            let b = c.detect(&url);
            prop_assert!(!a.as_str().is_empty());
            prop_assert_eq!(a, b);
        }
    }
}
