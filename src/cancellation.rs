//! Cooperative cancellation for blocking waits.
//!
//! A [`CancellationToken`] is a cloneable handle to a shared cancel flag.
//! Blocking primitives register a callback via [`CancellationToken::on_cancel`]
//! so that a `cancel()` call can wake them out of a condvar wait; the waiter
//! then observes the flag and bails out with [`Canceled`].

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Error produced when a wait is abandoned because its token was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the operation was canceled")]
pub struct Canceled;

type Callback = Box<dyn Fn() + Send + Sync>;

struct Inner {
    canceled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

/// Cloneable cancellation handle. All clones share the same cancel state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Fails with [`Canceled`] if the token has been canceled.
    pub fn check(&self) -> Result<(), Canceled> {
        if self.is_canceled() { Err(Canceled) } else { Ok(()) }
    }

    /// Cancels the token and runs every registered callback. Idempotent:
    /// later calls are no-ops.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = mem::take(&mut *self.inner.callbacks.lock().unwrap());
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Registers `callback` to run when the token is canceled. If the token
    /// is already canceled, the callback runs immediately on this thread.
    ///
    /// The registration is removed again when the returned guard is dropped.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: Callback = Box::new(callback);
        {
            // The canceled flag is re-checked under the lock: cancel() flips
            // the flag before draining the list, so either the push is part
            // of the drained list or we observe the flag here.
            let mut callbacks = self.inner.callbacks.lock().unwrap();
            if !self.is_canceled() {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                callbacks.push((id, callback));
                return CancelRegistration {
                    inner: Arc::clone(&self.inner),
                    id,
                };
            }
        }
        callback();
        CancelRegistration {
            inner: Arc::clone(&self.inner),
            id: 0,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

/// Guard for a callback registered with [`CancellationToken::on_cancel`].
#[must_use = "dropping the registration removes the callback from the token"]
pub struct CancelRegistration {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        // id 0 marks a register-after-cancel that was never stored.
        if self.id == 0 {
            return;
        }
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != self.id);
    }
}

impl fmt::Debug for CancelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelRegistration")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
