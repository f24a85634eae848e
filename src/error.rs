//! Error types for the Kiln compile server

use std::path::PathBuf;

use thiserror::Error;

use crate::compiler::CompileError;
use crate::operation::CancelError;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Kiln compile server
#[derive(Error, Debug)]
pub enum Error {
    /// A path handed to the cache engine escapes the configured project root.
    /// This is a configuration bug, never a cache miss.
    #[error("path {path} escapes project root {root}")]
    OutsideProjectRoot { path: PathBuf, root: PathBuf },

    /// Malformed configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Cooperative cancellation won a race against in-flight work.
    /// Expected control flow, not a defect; check with [`Error::is_cancellation`].
    #[error(transparent)]
    Cancelled(#[from] CancelError),

    /// Inter-process file lock could not be acquired within the retry budget
    #[error("timed out acquiring file lock for {key} after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    /// The external compiler collaborator failed
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// I/O error with the path that produced it
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cache entry (de)serialization error
    #[error("cache entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wraps an I/O error together with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True when this error is a cancellation signal rather than a failure.
    ///
    /// Callers must not log cancellations as failures; they are the expected
    /// outcome of a client going away or a deadline firing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// True when the error is worth retrying after a short delay
    /// (lock contention, transient filesystem pressure).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::LockTimeout { .. } => true,
            Error::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
