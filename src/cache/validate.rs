//! Cache entry validation.
//!
//! Multi-part and short-circuiting: the compiled file itself is checked
//! first (including any conditional validator supplied by the HTTP layer),
//! then the source list, then every tracked source and asset. The first
//! failure invalidates the whole entry; a missing file is an invalidation,
//! not an error.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

use super::etag::compute_etag;
use super::meta::{CacheEntry, TrackedFile};

/// Conditional validators forwarded by the HTTP layer, compared against the
/// compiled file's current content.
#[derive(Debug, Clone, Default)]
pub struct CacheConditions {
    /// `If-None-Match` etag, when the etag strategy is active
    pub if_etag_match: Option<String>,
    /// `If-Modified-Since` date, when the mtime strategy is active
    pub if_modified_since: Option<DateTime<Utc>>,
}

impl CacheConditions {
    /// True when the HTTP layer supplied any validator.
    pub fn is_conditional(&self) -> bool {
        self.if_etag_match.is_some() || self.if_modified_since.is_some()
    }
}

/// Why a cache entry was rejected. Worth a debug log line, never an error.
#[derive(Debug)]
pub(crate) enum Invalidity {
    CompiledFileMissing,
    CompiledEtagMismatch { expected: String, actual: String },
    CompiledNewerOnDisk,
    SourcesEmpty,
    SourceMissing(PathBuf),
    SourceChanged(PathBuf),
    AssetMissing(PathBuf),
    AssetChanged(PathBuf),
}

impl std::fmt::Display for Invalidity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invalidity::CompiledFileMissing => write!(f, "compiled file missing"),
            Invalidity::CompiledEtagMismatch { expected, actual } => {
                write!(f, "compiled etag mismatch (expected {expected}, found {actual})")
            }
            Invalidity::CompiledNewerOnDisk => {
                write!(f, "compiled file modified after supplied date")
            }
            Invalidity::SourcesEmpty => write!(f, "entry tracks no sources"),
            Invalidity::SourceMissing(path) => {
                write!(f, "source {} missing", path.display())
            }
            Invalidity::SourceChanged(path) => {
                write!(f, "source {} changed", path.display())
            }
            Invalidity::AssetMissing(path) => {
                write!(f, "asset {} missing", path.display())
            }
            Invalidity::AssetChanged(path) => {
                write!(f, "asset {} changed", path.display())
            }
        }
    }
}

/// Snapshot of a compiled file that survived validation; served directly so
/// the bytes are read exactly once per request.
pub(crate) struct ValidSnapshot {
    pub bytes: Bytes,
    pub etag: String,
}

pub(crate) type ValidationOutcome = std::result::Result<ValidSnapshot, Invalidity>;

/// Validates `entry` against the current filesystem state.
///
/// Returns `Ok(Err(_))` when the entry must be recompiled; the outer error
/// is reserved for filesystem failures that recompilation cannot fix.
pub(crate) async fn validate_entry(
    entry: &CacheEntry,
    compiled_path: &Path,
    companion_dir: &Path,
    project_root: &Path,
    conditions: &CacheConditions,
) -> Result<ValidationOutcome> {
    let bytes = match tokio::fs::read(compiled_path).await {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(Err(Invalidity::CompiledFileMissing));
        }
        Err(err) => return Err(Error::io(compiled_path, err)),
    };
    let actual_etag = compute_etag(&bytes);

    if let Some(expected) = &conditions.if_etag_match {
        if expected != &actual_etag {
            return Ok(Err(Invalidity::CompiledEtagMismatch {
                expected: expected.clone(),
                actual: actual_etag,
            }));
        }
    }

    if let Some(supplied) = conditions.if_modified_since {
        let metadata = tokio::fs::metadata(compiled_path)
            .await
            .map_err(|err| Error::io(compiled_path, err))?;
        let modified: DateTime<Utc> = metadata
            .modified()
            .map_err(|err| Error::io(compiled_path, err))?
            .into();
        // If-Modified-Since carries second precision.
        if modified.timestamp() > supplied.timestamp() {
            return Ok(Err(Invalidity::CompiledNewerOnDisk));
        }
    }

    // An empty source list means the entry never tracked anything; treat it
    // as suspicious and recompile.
    if entry.sources.is_empty() {
        return Ok(Err(Invalidity::SourcesEmpty));
    }

    for source in &entry.sources {
        let full = project_root.join(&source.path);
        if let Err(invalidity) = check_tracked(source, &full, Invalidity::SourceMissing, Invalidity::SourceChanged).await? {
            return Ok(Err(invalidity));
        }
    }

    for asset in &entry.assets {
        let full = companion_dir.join(&asset.path);
        if let Err(invalidity) = check_tracked(asset, &full, Invalidity::AssetMissing, Invalidity::AssetChanged).await? {
            return Ok(Err(invalidity));
        }
    }

    Ok(Ok(ValidSnapshot {
        bytes,
        etag: actual_etag,
    }))
}

/// Re-reads one tracked file and recomputes its validator.
async fn check_tracked(
    tracked: &TrackedFile,
    full_path: &Path,
    missing: fn(PathBuf) -> Invalidity,
    changed: fn(PathBuf) -> Invalidity,
) -> Result<std::result::Result<(), Invalidity>> {
    let bytes = match tokio::fs::read(full_path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(Err(missing(tracked.path.clone())));
        }
        Err(err) => return Err(Error::io(full_path, err)),
    };
    if compute_etag(&bytes) != tracked.etag {
        return Ok(Err(changed(tracked.path.clone())));
    }
    Ok(Ok(()))
}
