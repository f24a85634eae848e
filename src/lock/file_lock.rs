//! Inter-process mutual exclusion via OS file locks.
//!
//! A sentinel file beside the protected resource carries an exclusive
//! `flock`-style lock. Acquisition retries with bounded backoff; exhaustion
//! surfaces as [`Error::LockTimeout`], the only place in the crate where
//! automatic retry happens.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;

use fs4::FileExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::operation::CancellationToken;

use super::registry::LockConfig;

/// Acquires an exclusive lock on the sentinel at `path`, retrying up to
/// `config.retry_count` times with backoff between `retry_min` and
/// `retry_max`. The returned handle keeps the lock until unlocked or closed.
pub(crate) async fn acquire(
    path: &Path,
    config: &LockConfig,
    token: &CancellationToken,
) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| Error::io(path, err))?;

    let mut delay = config.retry_min;
    for attempt in 1..=config.retry_count {
        token.err_if_requested()?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                if attempt > 1 {
                    debug!(path = %path.display(), attempt, "file lock acquired after contention");
                }
                return Ok(file);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                debug!(path = %path.display(), attempt, delay_ms = delay.as_millis() as u64,
                    "file lock held elsewhere, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(config.retry_max);
            }
            Err(err) => return Err(Error::io(path, err)),
        }
    }

    Err(Error::LockTimeout {
        key: path.display().to_string(),
        attempts: config.retry_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> LockConfig {
        LockConfig {
            cross_process: true,
            retry_count: 3,
            retry_min: Duration::from_millis(5),
            retry_max: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn acquire_creates_sentinel_and_locks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sentinel = dir.path().join("cache").join("meta.json.lock");
        let token = CancellationToken::never();

        let file = acquire(&sentinel, &fast_config(), &token)
            .await
            .expect("uncontended lock");
        assert!(sentinel.exists());

        FileExt::unlock(&file).expect("unlock");
    }

    #[tokio::test]
    async fn contended_lock_times_out_after_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sentinel = dir.path().join("meta.json.lock");
        let token = CancellationToken::never();
        let config = fast_config();

        let holder = acquire(&sentinel, &config, &token).await.expect("holder");

        let outcome = acquire(&sentinel, &config, &token).await;
        assert!(matches!(
            outcome,
            Err(Error::LockTimeout { attempts: 3, .. })
        ));

        FileExt::unlock(&holder).expect("unlock");
    }
}
