//! The get-or-generate cache lifecycle.
//!
//! One entry point, [`CompileCache::get_or_generate`], owns the whole
//! create / validate / update / serve cycle for a compiled target. All reads
//! and writes of the `(compiled file, meta.json)` pair happen inside that
//! target's resource lock, so concurrent requests (and, with cross-process
//! locking, concurrent server processes) never interleave critical sections.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::compiler::{CompileRequest, Compiler, SourceDependency};
use crate::error::{Error, Result};
use crate::lock::ResourceLockRegistry;
use crate::operation::{run_concurrent, CancellationToken};

use super::etag::compute_etag;
use super::meta::{self, CacheEntry, TrackedFile};
use super::validate::{validate_entry, CacheConditions};

/// Configuration for the compile cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory every original and compiled path must live under
    pub project_root: PathBuf,

    /// Consult `meta.json` on disk before compiling
    pub read_from_cache: bool,

    /// Write compiled output, assets and `meta.json` back to disk
    pub persist: bool,

    /// Maintain `matchCount`/`lastMatchMs` on validated hits
    pub track_hits: bool,

    /// Wave size for hashing source dependencies at persist time
    pub hash_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            read_from_cache: true,
            persist: true,
            track_hits: false,
            hash_concurrency: 8,
        }
    }
}

/// How the artifact was produced for this request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// No usable entry existed; compiled from scratch
    Created,
    /// An entry existed but failed validation; recompiled
    Updated,
    /// The entry validated; served from disk without compiling
    Cached,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStatus::Created => write!(f, "created"),
            CacheStatus::Updated => write!(f, "updated"),
            CacheStatus::Cached => write!(f, "cached"),
        }
    }
}

/// The servable artifact produced by a get-or-generate call.
#[derive(Debug, Clone)]
pub struct CompiledOutput {
    /// Content type to serve with
    pub content_type: String,
    /// Compiled bytes (freshly compiled, or read back from disk)
    pub bytes: Bytes,
    /// Current content validator of the compiled bytes
    pub etag: String,
}

/// Result of [`CompileCache::get_or_generate`].
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub status: CacheStatus,
    pub entry: CacheEntry,
    pub output: CompiledOutput,
}

/// The compile cache engine.
///
/// The lock registry is injected rather than global, so multiple isolated
/// caches can coexist in one process.
pub struct CompileCache {
    config: CacheConfig,
    locks: Arc<ResourceLockRegistry>,
}

impl CompileCache {
    /// Creates an engine over `config`, serializing per-target access
    /// through `locks`.
    pub fn new(config: CacheConfig, locks: Arc<ResourceLockRegistry>) -> Self {
        Self { config, locks }
    }

    /// The configured project root.
    pub fn project_root(&self) -> &Path {
        &self.config.project_root
    }

    /// Returns the cached artifact for `compiled_path`, compiling via
    /// `compiler` when no valid entry exists.
    ///
    /// Both paths must resolve inside the project root; anything else is a
    /// configuration bug surfaced as [`Error::OutsideProjectRoot`].
    #[instrument(skip_all, fields(compiled = %compiled_path.display()))]
    pub async fn get_or_generate(
        &self,
        original_path: &Path,
        compiled_path: &Path,
        compiler: &dyn Compiler,
        conditions: &CacheConditions,
        token: &CancellationToken,
    ) -> Result<GenerateOutcome> {
        self.ensure_inside_root(original_path)?;
        self.ensure_inside_root(compiled_path)?;
        token.err_if_requested()?;

        let meta_path = meta::meta_path(compiled_path);
        let key = meta_path.to_string_lossy().into_owned();
        // Held for the whole lifecycle; released on drop whatever happens.
        let _guard = self.locks.lock(&key, token).await?;

        if !self.config.read_from_cache {
            return self
                .compile_fresh(original_path, compiled_path, compiler, token, None, CacheStatus::Created)
                .await;
        }

        let Some(entry) = meta::load(&meta_path).await else {
            return self
                .compile_fresh(original_path, compiled_path, compiler, token, None, CacheStatus::Created)
                .await;
        };

        let companion = meta::companion_dir(compiled_path);
        match validate_entry(&entry, compiled_path, &companion, &self.config.project_root, conditions)
            .await?
        {
            Ok(snapshot) => {
                debug!(status = %CacheStatus::Cached, "cache entry validated");
                let mut entry = entry;
                if self.config.track_hits {
                    entry.record_hit(Utc::now().timestamp_millis());
                    if self.config.persist {
                        meta::save(&meta_path, &entry).await?;
                    }
                }
                Ok(GenerateOutcome {
                    status: CacheStatus::Cached,
                    output: CompiledOutput {
                        content_type: entry.content_type.clone(),
                        bytes: snapshot.bytes,
                        etag: snapshot.etag,
                    },
                    entry,
                })
            }
            Err(invalidity) => {
                debug!(%invalidity, "cache entry invalid, recompiling");
                self.compile_fresh(
                    original_path,
                    compiled_path,
                    compiler,
                    token,
                    Some(&entry),
                    CacheStatus::Updated,
                )
                .await
            }
        }
    }

    /// Compiles, rebuilds the cache entry (reusing `base` for counters and
    /// creation time), and persists everything when enabled.
    async fn compile_fresh(
        &self,
        original_path: &Path,
        compiled_path: &Path,
        compiler: &dyn Compiler,
        token: &CancellationToken,
        base: Option<&CacheEntry>,
        status: CacheStatus,
    ) -> Result<GenerateOutcome> {
        token.err_if_requested()?;

        let result = compiler
            .compile(CompileRequest {
                original_path,
                compiled_path,
                project_root: &self.config.project_root,
                token,
            })
            .await?;

        let now = Utc::now().timestamp_millis();
        let sources = self.hash_sources(result.sources, token).await?;
        let assets: Vec<TrackedFile> = result
            .assets
            .iter()
            .map(|asset| TrackedFile {
                path: asset.path.clone(),
                etag: compute_etag(asset.content.as_bytes()),
            })
            .collect();

        let mut entry = CacheEntry {
            content_type: result.content_type.clone(),
            sources,
            assets,
            created_ms: base.map(|base| base.created_ms).unwrap_or(now),
            last_modified_ms: now,
            match_count: match (self.config.track_hits, base) {
                (false, _) => None,
                (true, Some(base)) => base.match_count.or(Some(0)),
                (true, None) => Some(0),
            },
            last_match_ms: base.and_then(|base| base.last_match_ms),
        };

        if self.config.persist {
            let companion = meta::companion_dir(compiled_path);
            write_file(compiled_path, result.compiled_source.as_bytes()).await?;
            // Pin the recorded timestamp to the file's actual mtime so the
            // second-precision If-Modified-Since comparison stays exact.
            if let Ok(metadata) = tokio::fs::metadata(compiled_path).await {
                if let Ok(modified) = metadata.modified() {
                    entry.last_modified_ms = DateTime::<Utc>::from(modified).timestamp_millis();
                }
            }
            for asset in &result.assets {
                write_file(&companion.join(&asset.path), asset.content.as_bytes()).await?;
            }
            meta::save(&meta::meta_path(compiled_path), &entry).await?;
        }

        let bytes = Bytes::from(result.compiled_source.into_bytes());
        let etag = compute_etag(&bytes);
        Ok(GenerateOutcome {
            status,
            entry,
            output: CompiledOutput {
                content_type: result.content_type,
                bytes,
                etag,
            },
        })
    }

    /// Hashes the declared sources in waves.
    ///
    /// Existence is re-checked here, independently of validation: a source
    /// that disappeared since the compile is dropped from the persisted
    /// entry (with a warning) instead of poisoning the cache as permanently
    /// "different".
    async fn hash_sources(
        &self,
        sources: Vec<SourceDependency>,
        token: &CancellationToken,
    ) -> Result<Vec<TrackedFile>> {
        let hashed = run_concurrent(sources, self.config.hash_concurrency, |dep| {
            let root = self.config.project_root.clone();
            let token = token.clone();
            async move {
                token.err_if_requested()?;
                let full = root.join(&dep.path);
                let etag = match dep.content {
                    Some(content) => {
                        // Content was handed to us, but the file itself must
                        // still exist to be worth tracking.
                        match tokio::fs::metadata(&full).await {
                            Ok(_) => compute_etag(content.as_bytes()),
                            Err(err) if err.kind() == ErrorKind::NotFound => {
                                warn!(source = %dep.path.display(),
                                    "source disappeared before persisting; dropping it from the cache entry");
                                return Ok(None);
                            }
                            Err(err) => return Err(Error::io(full, err)),
                        }
                    }
                    None => match tokio::fs::read(&full).await {
                        Ok(bytes) => compute_etag(&bytes),
                        Err(err) if err.kind() == ErrorKind::NotFound => {
                            warn!(source = %dep.path.display(),
                                "source disappeared before persisting; dropping it from the cache entry");
                            return Ok(None);
                        }
                        Err(err) => return Err(Error::io(full, err)),
                    },
                };
                Ok(Some(TrackedFile {
                    path: dep.path,
                    etag,
                }))
            }
        })
        .await;

        let mut tracked = Vec::with_capacity(hashed.len());
        for item in hashed {
            if let Some(file) = item? {
                tracked.push(file);
            }
        }
        Ok(tracked)
    }

    fn ensure_inside_root(&self, path: &Path) -> Result<()> {
        if path.starts_with(&self.config.project_root) {
            Ok(())
        } else {
            Err(Error::OutsideProjectRoot {
                path: path.to_path_buf(),
                root: self.config.project_root.clone(),
            })
        }
    }
}

/// Writes `bytes` at `path`, creating parent directories as needed.
async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| Error::io(parent, err))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|err| Error::io(path, err))
}
