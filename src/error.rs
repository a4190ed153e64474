//! Error types surfaced by barrier operations.

use crate::cancellation::Canceled;
use crate::state::MAX_PARTICIPANTS;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by barrier operations.
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum BarrierError {
    /// A participant count argument was zero or above the supported maximum.
    #[error("participant count {0} is out of range (limit {limit})", limit = MAX_PARTICIPANTS)]
    InvalidParticipantCount(u32),

    /// The barrier has been disposed.
    #[error("the barrier has been disposed")]
    Disposed,

    /// A structural operation was invoked by the thread that is currently
    /// running the post-phase action.
    #[error("operation invoked from within the post-phase action")]
    CalledFromPostPhaseAction,

    /// Adding this many participants would exceed the maximum.
    #[error("adding {added} participants would exceed the limit of {limit}", limit = MAX_PARTICIPANTS)]
    ParticipantLimitExceeded { added: u32 },

    /// More participants were asked to be removed than are registered.
    #[error("cannot remove {requested} participants, only {registered} are registered")]
    RemovalExceedsRegistered { requested: u32, registered: u32 },

    /// The removal would leave fewer participants than have already signaled
    /// the current phase.
    #[error("cannot remove down to {remaining} participants, {arrived} have already signaled")]
    RemovalBelowArrived { remaining: u32, arrived: u32 },

    /// `signal_and_wait` was called on a barrier with no registered
    /// participants.
    #[error("the barrier has no registered participants")]
    NoParticipants,

    /// More threads entered `signal_and_wait` than are registered as
    /// participants.
    #[error("more threads have signaled than are registered as participants")]
    ExcessSignalers,

    /// The wait was abandoned because the cancellation token fired.
    #[error(transparent)]
    Canceled(#[from] Canceled),

    /// The post-phase action failed. Delivered to the thread that ran the
    /// action and to every participant released by that phase.
    #[error("post-phase action failed: {0}")]
    PostPhase(PostPhaseError),
}

/// Failure raised by a post-phase action.
///
/// Clones share the underlying failure, so the one failure of a phase can be
/// handed to every participant that phase releases. The original error is
/// reachable through [`std::error::Error::source`].
#[derive(Debug, Clone)]
pub struct PostPhaseError(Arc<dyn std::error::Error + Send + Sync>);

impl PostPhaseError {
    pub(crate) fn new(source: Arc<dyn std::error::Error + Send + Sync>) -> Self {
        Self(source)
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned());
        Self(Arc::new(ActionPanic(message)))
    }
}

impl fmt::Display for PostPhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for PostPhaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Stand-in error for a post-phase action that panicked instead of returning
/// an `Err`.
#[derive(Debug)]
struct ActionPanic(Option<String>);

impl fmt::Display for ActionPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(message) => write!(f, "post-phase action panicked: {message}"),
            None => write!(f, "post-phase action panicked"),
        }
    }
}

impl std::error::Error for ActionPanic {}
