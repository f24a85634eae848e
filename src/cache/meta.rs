//! Persisted cache entries (`meta.json`).
//!
//! Each compiled file owns a companion `<name>__asset__/` directory holding
//! its `meta.json` and generated assets. The entry records which sources and
//! assets the compiled output depends on, with a content validator for each,
//! so the next request can decide whether the artifact is still valid.
//!
//! Source paths are relative to the project root; asset paths are relative
//! to the companion directory itself.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Name of the cache entry file within the companion directory.
pub const META_FILE: &str = "meta.json";

/// Suffix of the companion directory beside each compiled file.
const COMPANION_SUFFIX: &str = "__asset__";

/// A dependency record: one tracked file and the validator it had when the
/// artifact was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    /// Relative path (see module docs for the anchor per category)
    pub path: PathBuf,
    /// Content validator at compile time
    pub etag: String,
}

/// The persisted description of one compiled artifact.
///
/// Created on first successful compile, replaced wholesale on
/// invalidation+recompile, and left untouched except for hit counters on a
/// successful validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Content type the artifact is served with
    pub content_type: String,

    /// Source files the artifact was derived from
    pub sources: Vec<TrackedFile>,

    /// Generated companion files (sourcemap, coverage data)
    pub assets: Vec<TrackedFile>,

    /// When the entry was first created (epoch milliseconds)
    pub created_ms: i64,

    /// When the artifact was last (re)compiled (epoch milliseconds)
    pub last_modified_ms: i64,

    /// Validated-hit counter; present only when hit tracking is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_count: Option<u64>,

    /// Timestamp of the last validated hit (epoch milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_match_ms: Option<i64>,
}

impl CacheEntry {
    /// Records one validated cache hit.
    pub fn record_hit(&mut self, now_ms: i64) {
        self.match_count = Some(self.match_count.unwrap_or(0) + 1);
        self.last_match_ms = Some(now_ms);
    }
}

/// Companion directory beside `compiled_path` (`<name>__asset__`).
pub fn companion_dir(compiled_path: &Path) -> PathBuf {
    let name = compiled_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("out");
    compiled_path.with_file_name(format!("{name}{COMPANION_SUFFIX}"))
}

/// Location of the cache entry for `compiled_path`.
pub fn meta_path(compiled_path: &Path) -> PathBuf {
    companion_dir(compiled_path).join(META_FILE)
}

/// Loads the entry at `path`, returning `None` when it does not exist or
/// cannot be parsed.
///
/// Fail-safe: a corrupt entry is a cache miss and triggers a fresh compile,
/// never an error.
pub async fn load(path: &Path) -> Option<CacheEntry> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(entry) => Some(entry),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "discarding unreadable cache entry");
            None
        }
    }
}

/// Saves `entry` at `path`, creating the companion directory if needed.
pub async fn save(path: &Path, entry: &CacheEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| Error::io(parent, err))?;
    }
    let json = serde_json::to_vec_pretty(entry)?;
    tokio::fs::write(path, json)
        .await
        .map_err(|err| Error::io(path, err))
}
