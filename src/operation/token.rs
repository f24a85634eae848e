//! Cancellation sources, tokens and callback registrations.
//!
//! A [`CancellationSource`] owns exactly one token and the capability to
//! cancel it. Cancellation is a latch: the first `cancel` call wins, records
//! the reason, and fires registered callbacks most-recently-registered first
//! so that inner cleanup runs before outer cleanup. Later calls are no-ops.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::CancelError;

/// Reason recorded when a timed cancellation source fires.
pub const TIMEOUT_REASON: &str = "timeout";

/// Callback invoked with the cancellation reason.
///
/// Callbacks are identified by `Arc` pointer identity: registering the same
/// `Arc` twice arms it once.
pub type CancelCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Slot {
    id: u64,
    callback: CancelCallback,
}

struct State {
    requested: bool,
    reason: Option<String>,
    callbacks: Vec<Slot>,
    next_id: u64,
}

pub(crate) struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Shared {
            state: Mutex::new(State {
                requested: false,
                reason: None,
                callbacks: Vec::new(),
                next_id: 0,
            }),
            notify: Notify::new(),
        })
    }

    /// Latches the cancelled state and fires live callbacks in LIFO order.
    /// Only the first call has any effect.
    pub(crate) fn cancel(&self, reason: &str) {
        let fired = {
            let mut state = self.state.lock();
            if state.requested {
                return;
            }
            state.requested = true;
            state.reason = Some(reason.to_string());
            std::mem::take(&mut state.callbacks)
        };
        // Callbacks run outside the lock so they may register/unregister freely.
        for slot in fired.iter().rev() {
            (slot.callback)(reason);
        }
        self.notify.notify_waiters();
    }
}

/// Owns a cancellation token and the capability to cancel it.
pub struct CancellationSource {
    shared: Arc<Shared>,
}

impl CancellationSource {
    /// Creates a source whose token is not yet cancelled.
    pub fn new() -> Self {
        CancellationSource {
            shared: Shared::new(),
        }
    }

    /// Creates a source that cancels itself with reason [`TIMEOUT_REASON`]
    /// once `timeout` elapses. Requires a running tokio runtime.
    pub fn with_timeout(timeout: Duration) -> Self {
        let source = Self::new();
        let shared = Arc::clone(&source.shared);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            shared.cancel(TIMEOUT_REASON);
        });
        source
    }

    /// Cancels the token. Idempotent: the first call latches `reason` and
    /// fires callbacks; subsequent calls are no-ops.
    pub fn cancel(&self, reason: &str) {
        self.shared.cancel(reason);
    }

    /// The read-only token tied to this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only cancellation capability shared by all operations derived from
/// one cancellation scope.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    /// A token that can never be cancelled.
    pub fn never() -> Self {
        CancellationToken {
            shared: Shared::new(),
        }
    }

    /// True once the owning source has cancelled.
    pub fn cancellation_requested(&self) -> bool {
        self.shared.state.lock().requested
    }

    /// The latched cancellation reason, if any.
    pub fn reason(&self) -> Option<String> {
        self.shared.state.lock().reason.clone()
    }

    /// Fails with [`CancelError`] when cancellation has been requested.
    pub fn err_if_requested(&self) -> Result<(), CancelError> {
        let state = self.shared.state.lock();
        if state.requested {
            Err(CancelError::new(
                state.reason.clone().unwrap_or_default(),
            ))
        } else {
            Ok(())
        }
    }

    /// Registers `callback` to run when cancellation is requested.
    ///
    /// Registering on an already-cancelled token fires the callback
    /// immediately with the latched reason and returns an inert registration.
    /// Registering the same `Arc` twice is a no-op; the returned registration
    /// refers to the original slot.
    pub fn register(&self, callback: CancelCallback) -> Registration {
        let mut state = self.shared.state.lock();
        if state.requested {
            let reason = state.reason.clone().unwrap_or_default();
            drop(state);
            callback(&reason);
            return Registration {
                shared: Arc::clone(&self.shared),
                id: None,
            };
        }
        if let Some(slot) = state
            .callbacks
            .iter()
            .find(|slot| Arc::ptr_eq(&slot.callback, &callback))
        {
            return Registration {
                shared: Arc::clone(&self.shared),
                id: Some(slot.id),
            };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push(Slot { id, callback });
        Registration {
            shared: Arc::clone(&self.shared),
            id: Some(id),
        }
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.shared.notify.notified();
            if self.cancellation_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to a registered cancellation callback.
///
/// Dropping a registration leaves the callback armed; call
/// [`Registration::unregister`] to remove it before cancellation fires.
pub struct Registration {
    shared: Arc<Shared>,
    id: Option<u64>,
}

impl Registration {
    /// Removes the callback so it will not fire on cancellation.
    pub fn unregister(self) {
        if let Some(id) = self.id {
            let mut state = self.shared.state.lock();
            state.callbacks.retain(|slot| slot.id != id);
        }
    }
}

/// Composes tokens into one that cancels when **any** parent fires.
///
/// The first parent to fire determines the captured reason; later parent
/// cancellations are ignored. Parents already cancelled at compose time are
/// honoured in argument order.
pub fn compose_tokens(parents: &[CancellationToken]) -> CancellationToken {
    let source = CancellationSource::new();
    for parent in parents {
        let shared = source.shared.clone();
        parent.register(Arc::new(move |reason: &str| shared.cancel(reason)));
    }
    source.token()
}
