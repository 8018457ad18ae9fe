use crate::{ChunkMatch, LanguageTag, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    /// If true, allow reading from cache.
    pub read: bool,
    /// If true, allow writing to cache.
    pub write: bool,
    /// If set, cached entries older than this are treated as a miss.
    pub ttl_s: Option<u64>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            ttl_s: None,
        }
    }
}

/// Hex SHA-256 identifying one pipeline input set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Both URL lists are sorted before hashing, so upstream ordering noise maps to the same key.
    pub fn derive(
        old_urls: &[String],
        new_urls: &[String],
        business_context: Option<&str>,
        temperature: f64,
    ) -> Self {
        let mut old: Vec<&str> = old_urls.iter().map(String::as_str).collect();
        let mut new: Vec<&str> = new_urls.iter().map(String::as_str).collect();
        old.sort_unstable();
        new.sort_unstable();

        let doc = serde_json::json!({
            "old_urls": old,
            "new_urls": new,
            "business_context": business_context.unwrap_or("").trim(),
            "temperature": temperature,
        });
        let mut h = Sha256::new();
        h.update(b"redirmap-cache-v1\n");
        h.update(doc.to_string().as_bytes());
        Self(hex::encode(h.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Matching-stage output of a run: everything the service answered, per language,
/// before confidence filtering. Threshold and fallback settings are applied on top,
/// so they can change without invalidating the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub languages: BTreeMap<LanguageTag, ChunkMatch>,
}

/// Optional store of match snapshots. Read once before matching, written once after.
pub trait ResultCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<MatchSnapshot>>;
    fn put(&self, key: &CacheKey, snapshot: &MatchSnapshot) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn key_ignores_input_order() {
        let a = CacheKey::derive(&v(&["/b", "/a"]), &v(&["/y", "/x"]), Some("ctx"), 0.1);
        let b = CacheKey::derive(&v(&["/a", "/b"]), &v(&["/x", "/y"]), Some(" ctx "), 0.1);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn key_depends_on_every_parameter() {
        let base = CacheKey::derive(&v(&["/a"]), &v(&["/x"]), None, 0.1);
        assert_ne!(base, CacheKey::derive(&v(&["/a"]), &v(&["/x"]), Some("ctx"), 0.1));
        assert_ne!(base, CacheKey::derive(&v(&["/a"]), &v(&["/x"]), None, 0.2));
        assert_ne!(base, CacheKey::derive(&v(&["/a"]), &v(&["/z"]), None, 0.1));
        // Lists are not interchangeable.
        assert_ne!(base, CacheKey::derive(&v(&["/x"]), &v(&["/a"]), None, 0.1));
        assert_eq!(base, CacheKey::derive(&v(&["/a"]), &v(&["/x"]), Some("  "), 0.1));
    }
}
