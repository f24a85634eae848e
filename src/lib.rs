//! Kiln - Development-Time Compile Server
//!
//! Compiles project source files on demand, caches the compiled artifacts on
//! disk, serves them over HTTP with conditional-request semantics, and
//! guarantees correct invalidation when sources change - while multiple
//! requests (and multiple OS processes sharing one cache directory) may ask
//! for the same artifact concurrently.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Kiln Compile Server                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ HTTP Adapter │───▶│ Compile      │───▶│ Resource     │       │
//! │  │ (conditional │    │ Cache Engine │    │ Lock         │       │
//! │  │  responses)  │    │ (get-or-gen) │    │ Registry     │       │
//! │  └──────────────┘    └──────┬───────┘    └──────┬───────┘       │
//! │                             │                   │                │
//! │                             ▼                   ▼                │
//! │                  ┌─────────────────────────────────────────┐    │
//! │                  │   Cancellation / Operation Framework    │    │
//! │                  └─────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Data flows one way: the HTTP adapter asks the cache engine for an
//! artifact, the engine serializes access through the lock registry, and
//! everything that may suspend runs under a cancellation token. The actual
//! source-to-target transformation is an external collaborator behind the
//! [`compiler::Compiler`] trait.
//!
//! # Modules
//!
//! - [`operation`] - Cancellation tokens, sources and operation racing
//! - [`lock`] - Per-key local + inter-process resource locks
//! - [`cache`] - The get-or-generate compile cache engine
//! - [`compiler`] - The external transform seam
//! - [`server`] - Conditional HTTP serving adapter
//! - [`error`] - Error types

pub mod cache;
pub mod compiler;
pub mod error;
pub mod lock;
pub mod operation;
pub mod server;

// Re-export commonly used types
pub use cache::{CacheConditions, CacheConfig, CacheStatus, CompileCache, GenerateOutcome};
pub use compiler::{CompileError, CompileResult, Compiler, PassthroughCompiler};
pub use error::{Error, Result};
pub use lock::{LockConfig, ResourceLockRegistry};
pub use operation::{CancelError, CancellationSource, CancellationToken};
pub use server::{CacheStrategy, ServeConfig, ServeContext, ServerHandle};

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
