//! Implements a manual-reset event using a Mutex and a Condvar from the std
//! library.
//!
//! Once set, the event stays set and releases every waiter until it is
//! explicitly reset. The blocking wait honors an optional timeout and an
//! optional [`CancellationToken`].

use crate::cancellation::{Canceled, CancellationToken};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Inner {
    is_set: AtomicBool,
    lock: Mutex<()>,
    wakeups: Condvar,
}

impl Inner {
    fn notify_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.wakeups.notify_all();
    }
}

/// A manual-reset event.
#[derive(Debug)]
pub struct ManualResetEvent {
    inner: Arc<Inner>,
}

impl ManualResetEvent {
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                is_set: AtomicBool::new(initially_set),
                lock: Mutex::new(()),
                wakeups: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.is_set.load(Ordering::Acquire)
    }

    /// Sets the event, releasing all current and future waiters.
    pub fn set(&self) {
        self.inner.is_set.store(true, Ordering::Release);
        self.inner.notify_all();
    }

    /// Resets the event so that subsequent waits block again.
    pub fn reset(&self) {
        self.inner.is_set.store(false, Ordering::Release);
    }

    /// Blocks until the event is set.
    pub fn wait(&self) {
        if self.is_set() {
            return;
        }
        let mut guard = self.inner.lock.lock().unwrap();
        while !self.is_set() {
            guard = self.inner.wakeups.wait(guard).unwrap();
        }
    }

    /// Blocks until the event is set (`Ok(true)`), the timeout elapses
    /// (`Ok(false)`) or the token is canceled. `None` blocks indefinitely.
    pub fn wait_with(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, Canceled> {
        if let Some(token) = cancel {
            token.check()?;
        }
        if self.is_set() {
            return Ok(true);
        }

        // A cancel() call must be able to wake us out of the condvar wait.
        let _registration = cancel.map(|token| {
            let inner = Arc::clone(&self.inner);
            token.on_cancel(move || inner.notify_all())
        });

        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut guard = self.inner.lock.lock().unwrap();
        loop {
            if self.is_set() {
                return Ok(true);
            }
            if let Some(token) = cancel {
                token.check()?;
            }
            match deadline {
                // No deadline (or one beyond the representable range).
                None => guard = self.inner.wakeups.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    let (next_guard, _timeout_result) = self
                        .inner
                        .wakeups
                        .wait_timeout(guard, deadline - now)
                        .unwrap();
                    guard = next_guard;
                }
            }
        }
    }
}
