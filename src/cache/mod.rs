//! Compile Cache Engine
//!
//! Get-or-generate lifecycle for compiled artifacts: read the persisted
//! cache entry, validate it against current filesystem state, recompile when
//! invalid, persist results, and report whether the artifact was `created`,
//! `updated` or `cached`.

mod engine;
mod etag;
mod meta;
mod validate;

pub use engine::{CacheConfig, CacheStatus, CompileCache, CompiledOutput, GenerateOutcome};
pub use etag::{compute_etag, EMPTY_ETAG};
pub use meta::{companion_dir, meta_path, CacheEntry, TrackedFile, META_FILE};
pub use validate::CacheConditions;
