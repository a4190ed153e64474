//! Stable integer identifiers for OS threads.
//!
//! Each thread gets a nonzero id on first use; id 0 is reserved so the
//! barrier can use it as the "no thread" value of its reentry guard.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
}

/// Returns the calling thread's id. Stable for the thread's lifetime.
#[must_use]
pub fn current() -> u64 {
    THREAD_ID.with(|id| *id)
}
