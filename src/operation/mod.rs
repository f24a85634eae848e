//! Cancellation & Operation Framework
//!
//! Cooperative cancellation tokens, sources, and operations that race
//! arbitrary async work against cancellation. Everything in this crate that
//! may suspend (file I/O, lock acquisition, the external compiler) receives
//! a [`CancellationToken`] and observes it at its next suspension point;
//! nothing is preempted mid-step.

mod run;
mod token;

pub use run::{
    run_concurrent, run_operation, run_stoppable_operation, StoppableOperation, Stopper,
};
pub use token::{
    compose_tokens, CancelCallback, CancellationSource, CancellationToken, Registration,
    TIMEOUT_REASON,
};

use std::time::Duration;

/// Error produced when cooperative cancellation wins a race against in-flight
/// work. Expected control flow, not a defect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled: {reason}")]
pub struct CancelError {
    /// Reason latched by the first `cancel` call.
    pub reason: String,
}

impl CancelError {
    /// Creates a cancellation error carrying `reason`.
    pub fn new(reason: impl Into<String>) -> Self {
        CancelError {
            reason: reason.into(),
        }
    }
}

/// Derives a token that cancels when either `parent` fires or `timeout`
/// elapses; whichever fires first determines the captured reason
/// ([`TIMEOUT_REASON`] for the timer).
pub fn token_with_deadline(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let timed = CancellationSource::with_timeout(timeout);
    compose_tokens(&[parent.clone(), timed.token()])
}
