//! Resource Lock Registry
//!
//! Per-key mutual exclusion for cache targets: a local async lock table,
//! optionally backed by an OS-level file lock so that multiple server
//! processes sharing one cache directory never overlap critical sections.
//! Mutual exclusion is the hard guarantee; waiter ordering beyond that is
//! not promised.

mod file_lock;
mod registry;

pub use registry::{LockConfig, ResourceGuard, ResourceLockRegistry};
