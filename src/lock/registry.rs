//! Per-key resource lock registry.
//!
//! Serializes access to one cache target (its `meta.json` path) across
//! concurrent requests. The registry is instance-scoped: every server (or
//! test) builds its own, so multiple isolated caches can coexist in-process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::error::Result;
use crate::operation::{CancelError, CancellationToken};

use super::file_lock;

/// Configuration for resource locking
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Also acquire an OS-level file lock so separate server processes
    /// sharing one cache directory never compile the same target twice
    pub cross_process: bool,

    /// Attempts before giving up on the inter-process lock
    pub retry_count: u32,

    /// Initial delay between inter-process lock attempts
    pub retry_min: Duration,

    /// Delay cap for inter-process lock attempts
    pub retry_max: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            cross_process: false,
            retry_count: 20,
            retry_min: Duration::from_millis(30),
            retry_max: Duration::from_millis(250),
        }
    }
}

type LockTable = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Per-key mutual exclusion: at most one holder per key at a time; waiters
/// are granted the key as holders release it. Distinct keys are fully
/// independent.
pub struct ResourceLockRegistry {
    table: LockTable,
    config: LockConfig,
}

impl ResourceLockRegistry {
    /// Creates an empty registry.
    pub fn new(config: LockConfig) -> Self {
        Self {
            table: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Acquires the lock for `key`, queueing behind the current holder if
    /// one exists. With `cross_process` enabled, additionally acquires an
    /// exclusive file lock on `<key>.lock` with bounded retries.
    ///
    /// The local lock is always released when the guard drops, even if the
    /// inter-process lock fails or the protected work errors.
    pub async fn lock(&self, key: &str, token: &CancellationToken) -> Result<ResourceGuard> {
        token.err_if_requested()?;

        let mutex = self
            .table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let local = tokio::select! {
            guard = mutex.lock_owned() => guard,
            _ = token.cancelled() => {
                prune(&self.table, key);
                return Err(CancelError::new(token.reason().unwrap_or_default()).into());
            }
        };

        let mut guard = ResourceGuard {
            key: key.to_string(),
            table: Arc::clone(&self.table),
            local: Some(local),
            file: None,
        };

        if self.config.cross_process {
            let sentinel = format!("{key}.lock");
            // On failure the partially-built guard drops, releasing the
            // local lock and pruning the table entry.
            let file = file_lock::acquire(Path::new(&sentinel), &self.config, token).await?;
            guard.file = Some(file);
        }

        Ok(guard)
    }

    /// Number of keys currently tracked (holders or waiters). Test hook.
    pub fn tracked_keys(&self) -> usize {
        self.table.len()
    }
}

/// Drops the table entry for `key` once nothing references it anymore.
fn prune(table: &LockTable, key: &str) {
    table.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
}

/// Holder of a resource lock. Releasing happens on drop (the
/// `finally`-equivalent) or explicitly via [`ResourceGuard::unlock`];
/// whichever comes first hands the key to the next waiter.
pub struct ResourceGuard {
    key: String,
    table: LockTable,
    local: Option<OwnedMutexGuard<()>>,
    file: Option<std::fs::File>,
}

impl ResourceGuard {
    /// Releases the lock, waking the next waiter for this key if any.
    pub fn unlock(self) {}
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = fs4::FileExt::unlock(&file) {
                warn!(key = %self.key, error = %err, "failed to release inter-process lock");
            }
        }
        // Release the local slot before deciding whether the entry is dead.
        self.local.take();
        prune(&self.table, &self.key);
    }
}
