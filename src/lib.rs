#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::must_use_candidate,
    clippy::perf
    // clippy::restriction,
    // clippy::pedantic
)]
// now allow a few rules which are denied by the above statement
// --> they are ridiculous and not necessary
#![allow(
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::fallible_impl_from
)]
#![deny(missing_debug_implementations)]

//! A phased barrier: a group of threads repeatedly rendezvous and proceed in
//! lock-step through numbered phases, with dynamic participant registration,
//! timeout- and cancellation-aware waiting, and an optional post-phase action
//! run once per phase by the last arriving thread.
//!
//! ```
//! use phased_barrier::Barrier;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let barrier = Arc::new(Barrier::new(2)?);
//! let partner = {
//!     let barrier = Arc::clone(&barrier);
//!     thread::spawn(move || {
//!         for _ in 0..3 {
//!             barrier.signal_and_wait().unwrap();
//!         }
//!     })
//! };
//! for _ in 0..3 {
//!     barrier.signal_and_wait()?;
//! }
//! partner.join().unwrap();
//! assert_eq!(barrier.current_phase(), 3);
//! # Ok::<(), phased_barrier::BarrierError>(())
//! ```

pub mod barrier;
pub mod cancellation;
pub mod error;
pub mod event;
pub mod thread_id;

mod state;

pub use barrier::{Barrier, PostPhaseAction};
pub use cancellation::{CancelRegistration, Canceled, CancellationToken};
pub use error::{BarrierError, PostPhaseError};
pub use event::ManualResetEvent;
