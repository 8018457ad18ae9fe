use redirmap_core::{CacheKey, Error, MatchSnapshot, ResultCache, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod export;
pub mod inputs;
pub mod openai_compat;

const CACHE_SCHEMA_VERSION: u64 = 1;

/// Match snapshots on disk, one JSON file per key under `root/aa/bb/<key>.json`.
#[derive(Debug, Clone)]
pub struct FsCache {
    root: PathBuf,
    ttl_s: Option<u64>,
}

impl FsCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root, ttl_s: None }
    }

    /// Entries older than `ttl_s` seconds read as misses.
    pub fn with_ttl(mut self, ttl_s: Option<u64>) -> Self {
        self.ttl_s = ttl_s;
        self
    }

    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("redirmap-cache")
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        let dir = match (key.get(0..2), key.get(2..4)) {
            (Some(a), Some(b)) => self.root.join(a).join(b),
            _ => self.root.clone(),
        };
        dir.join(format!("{key}.json"))
    }

    /// Count the entries on disk and their total size.
    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for entry in self.entries()? {
            stats.entries += 1;
            stats.bytes += entry.bytes;
            if let Some(at) = entry.cached_at_epoch_s {
                stats.oldest_epoch_s = Some(stats.oldest_epoch_s.map_or(at, |o| o.min(at)));
            }
        }
        Ok(stats)
    }

    /// Delete entries written more than `older_than_s` seconds ago, plus unreadable ones.
    /// Returns how many files were removed.
    pub fn prune(&self, older_than_s: u64) -> Result<usize> {
        let now = Self::now_s();
        let mut removed = 0;
        for entry in self.entries()? {
            let stale = match entry.cached_at_epoch_s {
                Some(at) => now.saturating_sub(at) > older_than_s,
                None => true,
            };
            if stale {
                fs::remove_file(&entry.path).map_err(|e| Error::Cache(e.to_string()))?;
                removed += 1;
            }
        }
        tracing::info!(root = %self.root.display(), removed, "cache pruned");
        Ok(removed)
    }

    fn entries(&self) -> Result<Vec<DiskEntry>> {
        let mut files = Vec::new();
        collect_json(&self.root, 0, &mut files)?;
        Ok(files
            .into_iter()
            .map(|(path, bytes)| {
                let cached_at_epoch_s = fs::read(&path)
                    .ok()
                    .and_then(|b| serde_json::from_slice::<serde_json::Value>(&b).ok())
                    .and_then(|v| v.get("cached_at_epoch_s").and_then(|t| t.as_u64()));
                DiskEntry {
                    path,
                    bytes,
                    cached_at_epoch_s,
                }
            })
            .collect())
    }

    fn now_s() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_secs()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub oldest_epoch_s: Option<u64>,
}

struct DiskEntry {
    path: PathBuf,
    bytes: u64,
    cached_at_epoch_s: Option<u64>,
}

/// `.json` files under `dir`, descending at most the two shard levels.
fn collect_json(dir: &Path, depth: usize, out: &mut Vec<(PathBuf, u64)>) -> Result<()> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Cache(e.to_string())),
    };
    for item in rd {
        let item = item.map_err(|e| Error::Cache(e.to_string()))?;
        let path = item.path();
        let meta = item.metadata().map_err(|e| Error::Cache(e.to_string()))?;
        if meta.is_dir() {
            if depth < 2 {
                collect_json(&path, depth + 1, out)?;
            }
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            out.push((path, meta.len()));
        }
    }
    Ok(())
}

impl ResultCache for FsCache {
    fn get(&self, key: &CacheKey) -> Result<Option<MatchSnapshot>> {
        let p = self.path(key.as_str());
        if !p.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&p).map_err(|e| Error::Cache(e.to_string()))?;

        // A damaged or foreign entry is a miss; the next successful run overwrites it.
        let mut entry: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %p.display(), error = %e, "ignoring unreadable cache entry");
                return Ok(None);
            }
        };
        if entry.get("schema_version").and_then(|v| v.as_u64()) != Some(CACHE_SCHEMA_VERSION) {
            return Ok(None);
        }
        let cached_at = entry
            .get("cached_at_epoch_s")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if let Some(ttl_s) = self.ttl_s {
            if Self::now_s().saturating_sub(cached_at) > ttl_s {
                tracing::debug!(key = %key, "cache entry expired");
                return Ok(None);
            }
        }

        let Some(snapshot) = entry.get_mut("snapshot").map(serde_json::Value::take) else {
            return Ok(None);
        };
        match serde_json::from_value::<MatchSnapshot>(snapshot) {
            Ok(s) => Ok(Some(s)),
            Err(e) => {
                tracing::warn!(path = %p.display(), error = %e, "ignoring malformed cache snapshot");
                Ok(None)
            }
        }
    }

    fn put(&self, key: &CacheKey, snapshot: &MatchSnapshot) -> Result<()> {
        let p = self.path(key.as_str());
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Cache(e.to_string()))?;
        }
        let entry = serde_json::json!({
            "schema_version": CACHE_SCHEMA_VERSION,
            "cached_at_epoch_s": Self::now_s(),
            "cache_key": key.as_str(),
            "languages": snapshot.languages.keys().collect::<Vec<_>>(),
            "snapshot": snapshot,
        });
        fs::write(
            &p,
            serde_json::to_vec_pretty(&entry).map_err(|e| Error::Cache(e.to_string()))?,
        )
        .map_err(|e| Error::Cache(e.to_string()))?;
        tracing::debug!(key = %key, path = %p.display(), "cache entry written");
        Ok(())
    }
}
