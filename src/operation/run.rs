//! Operations: async work raced against cooperative cancellation.
//!
//! An operation is transient; it exists only for the duration of one call.
//! When cancellation wins the race the losing work is never abandoned
//! mid-flight: it keeps running to completion in the background and its
//! outcome is discarded, so no file handle or subprocess is leaked.

use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use super::token::CancellationToken;
use super::CancelError;

/// Races `work` against cancellation.
///
/// If the token is already cancelled the call fails immediately without
/// spawning `work`. Otherwise `work` runs on the runtime and the first of
/// `{work outcome, cancellation}` wins. A cancelled operation drains the
/// spawned work in the background rather than aborting it.
pub async fn run_operation<T, W>(token: &CancellationToken, work: W) -> Result<T, CancelError>
where
    T: Send + 'static,
    W: Future<Output = T> + Send + 'static,
{
    token.err_if_requested()?;

    let mut handle = tokio::spawn(work);
    tokio::select! {
        joined = &mut handle => match joined {
            Ok(value) => Ok(value),
            Err(join_error) => match join_error.try_into_panic() {
                Ok(panic) => std::panic::resume_unwind(panic),
                Err(_) => Err(CancelError::new("runtime shutting down")),
            },
        },
        _ = token.cancelled() => {
            let reason = token.reason().unwrap_or_default();
            // Drain the loser so in-flight I/O runs to completion.
            tokio::spawn(async move {
                let _ = handle.await;
            });
            Err(CancelError::new(reason))
        }
    }
}

type Cleanup = Box<dyn FnOnce(String) -> BoxFuture<'static, ()> + Send>;

struct StopState {
    done: OnceCell<()>,
    cleanup: Mutex<Option<Cleanup>>,
}

/// Manual stop entry point for a stoppable operation.
///
/// `stop` runs the caller-supplied cleanup exactly once, whether triggered
/// manually or by cancellation; concurrent and late callers share the same
/// outcome.
#[derive(Clone)]
pub struct Stopper {
    inner: Arc<StopState>,
}

impl Stopper {
    /// Runs the cleanup once: awaits the work value, then tears it down with
    /// `reason`. Subsequent calls return once the first has completed.
    pub async fn stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.inner
            .done
            .get_or_init(|| {
                let cleanup = self.inner.cleanup.lock().take();
                async move {
                    if let Some(cleanup) = cleanup {
                        cleanup(reason).await;
                    }
                }
            })
            .await;
    }
}

/// An in-flight stoppable operation.
pub struct StoppableOperation<T> {
    outcome: BoxFuture<'static, Result<T, CancelError>>,
    stopper: Stopper,
}

impl<T> StoppableOperation<T> {
    /// A cloneable handle that tears the operation down.
    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    /// Resolves with the work's value, or with [`CancelError`] when
    /// cancellation won the race.
    pub async fn wait(self) -> Result<T, CancelError> {
        self.outcome.await
    }
}

/// Starts `work` with a `stop` teardown wired to both manual stopping and
/// cancellation.
///
/// The teardown first awaits the work's value, then receives it together
/// with the stop reason. It runs at most once even if a manual stop and a
/// cancellation race each other.
pub fn run_stoppable_operation<T, W, S, SF>(
    token: &CancellationToken,
    work: W,
    stop: S,
) -> Result<StoppableOperation<T>, CancelError>
where
    T: Clone + Send + Sync + 'static,
    W: Future<Output = T> + Send + 'static,
    S: FnOnce(T, String) -> SF + Send + 'static,
    SF: Future<Output = ()> + Send + 'static,
{
    token.err_if_requested()?;

    let handle = tokio::spawn(work);
    let value: Shared<BoxFuture<'static, Option<T>>> = async move {
        match handle.await {
            Ok(value) => Some(value),
            Err(join_error) => match join_error.try_into_panic() {
                Ok(panic) => std::panic::resume_unwind(panic),
                Err(_) => None,
            },
        }
    }
    .boxed()
    .shared();

    let value_for_stop = value.clone();
    let cleanup: Cleanup = Box::new(move |reason: String| {
        async move {
            if let Some(value) = value_for_stop.await {
                stop(value, reason).await;
            }
        }
        .boxed()
    });
    let stopper = Stopper {
        inner: Arc::new(StopState {
            done: OnceCell::new(),
            cleanup: Mutex::new(Some(cleanup)),
        }),
    };

    let cancel_stopper = stopper.clone();
    token.register(Arc::new(move |reason: &str| {
        let stopper = cancel_stopper.clone();
        let reason = reason.to_string();
        tokio::spawn(async move {
            stopper.stop(reason).await;
        });
    }));

    let outcome_token = token.clone();
    let outcome = async move {
        tokio::select! {
            value = value => match value {
                Some(value) => Ok(value),
                None => Err(CancelError::new("runtime shutting down")),
            },
            _ = outcome_token.cancelled() => {
                Err(CancelError::new(outcome_token.reason().unwrap_or_default()))
            }
        }
    }
    .boxed();

    Ok(StoppableOperation { outcome, stopper })
}

/// Processes `items` in fixed-size waves of `concurrency_limit`.
///
/// Every item of a wave settles before the next wave begins, which bounds
/// how long any item can be starved by a persistently slow neighbour.
/// Output order matches input order regardless of intra-wave completion
/// order.
///
/// # Panics
///
/// Panics when `concurrency_limit` is zero; that is a configuration bug.
pub async fn run_concurrent<I, T, F, Fut>(
    items: Vec<I>,
    concurrency_limit: usize,
    mut start: F,
) -> Vec<T>
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = T>,
{
    assert!(
        concurrency_limit > 0,
        "concurrency limit must be at least 1"
    );

    let mut results = Vec::with_capacity(items.len());
    let mut queue = items.into_iter();
    loop {
        let wave: Vec<_> = queue
            .by_ref()
            .take(concurrency_limit)
            .map(&mut start)
            .collect();
        if wave.is_empty() {
            break;
        }
        results.extend(join_all(wave).await);
    }
    results
}
