use crate::cache::{CACHE_SCHEMA_VERSION, Cache, CacheState};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::warn;

/// JSON file backing a [`Cache`] between runs.
#[derive(Debug, Clone)]
pub struct CacheFile {
    path: PathBuf,
    ttl_secs: u64,
}

impl CacheFile {
    pub fn new(path: impl Into<PathBuf>, ttl_secs: u64) -> Self {
        Self {
            path: path.into(),
            ttl_secs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty cache. A file with another schema version
    /// is an error.
    pub fn load(&self) -> Result<Cache> {
        if !self.path.exists() {
            return Ok(Cache::new(self.ttl_secs));
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read cache file {}", self.path.display()))?;
        let state: CacheState = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse cache file {}", self.path.display()))?;
        if state.schema_version != CACHE_SCHEMA_VERSION {
            bail!(
                "cache file {} has schema version {}, expected {}",
                self.path.display(),
                state.schema_version,
                CACHE_SCHEMA_VERSION
            );
        }
        Ok(Cache::from_state(state, self.ttl_secs))
    }

    pub fn load_or_empty(&self) -> Cache {
        self.load().unwrap_or_else(|err| {
            warn!(cache = %self.path.display(), error = %err, "ignoring unreadable cache file");
            Cache::new(self.ttl_secs)
        })
    }

    /// Drops expired entries, then replaces the file through a sibling
    /// `.tmp` file. Returns the number of pruned entries.
    pub fn save(&self, cache: &mut Cache, now: DateTime<Utc>) -> Result<usize> {
        let pruned = cache.prune(now);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache directory {}", parent.display()))?;
        }

        let serialized = serde_json::to_string_pretty(cache.state())?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, serialized)
            .with_context(|| format!("failed to write cache file {}", staging.display()))?;
        std::fs::rename(&staging, &self.path)
            .with_context(|| format!("failed to replace cache file {}", self.path.display()))?;
        Ok(pruned)
    }
}
