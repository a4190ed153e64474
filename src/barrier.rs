//! The phased barrier. See [`Barrier`].

use crate::cancellation::{Canceled, CancellationToken};
use crate::error::{BarrierError, PostPhaseError};
use crate::event::ManualResetEvent;
use crate::state::{Backoff, MAX_PARTICIPANTS, Sense, StateCell, decode};
use crate::thread_id;
use log::trace;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Callback run once per phase by the last arriving participant, between the
/// state word's sense flip and the release of the waiters.
pub type PostPhaseAction =
    Box<dyn Fn(&Barrier) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync>;

/// A barrier over which a dynamically sized group of threads proceeds in
/// lock-step through numbered phases.
///
/// Every participant calls [`Self::signal_and_wait`] once per phase. The last
/// arrival completes the phase: it runs the optional post-phase action and
/// then releases all waiters into the next phase. Arrival bookkeeping is a
/// CAS loop over one packed atomic word; release goes through two alternating
/// manual-reset events selected by a per-phase sense bit, so a fast thread
/// from the next phase can never consume the wakeup of the previous one.
pub struct Barrier {
    state: StateCell,
    phase: AtomicU64,
    even_event: ManualResetEvent,
    odd_event: ManualResetEvent,
    post_phase: Option<PostPhaseAction>,
    // Thread id currently executing the post-phase action, 0 if none.
    action_caller: AtomicU64,
    outcomes: Mutex<PhaseOutcomes>,
    disposed: AtomicBool,
}

/// Post-phase outcomes of the two most recent completed phases, keyed by
/// phase number.
///
/// A participant released from phase `p` must observe phase `p`'s outcome,
/// never a later one. A straggler whose backout lost the race against the
/// phase completion can still be catching up while the next phase completes,
/// so the outcome of one phase back is kept alongside the newest.
#[derive(Debug)]
struct PhaseOutcomes {
    // Newest first.
    entries: [Option<PhaseOutcome>; 2],
}

#[derive(Debug)]
struct PhaseOutcome {
    phase: u64,
    failure: Option<PostPhaseError>,
}

impl PhaseOutcomes {
    const fn new() -> Self {
        Self {
            entries: [None, None],
        }
    }

    fn record(&mut self, phase: u64, failure: Option<PostPhaseError>) {
        self.entries[1] = self.entries[0].take();
        self.entries[0] = Some(PhaseOutcome { phase, failure });
    }

    fn failure_of(&self, phase: u64) -> Option<PostPhaseError> {
        self.entries
            .iter()
            .flatten()
            .find(|outcome| outcome.phase == phase)
            .and_then(|outcome| outcome.failure.clone())
    }
}

impl Barrier {
    /// Highest participant count a barrier supports.
    pub const MAX_PARTICIPANTS: u32 = MAX_PARTICIPANTS;

    /// Creates a barrier for `participants` threads and no post-phase action.
    pub fn new(participants: u32) -> Result<Self, BarrierError> {
        Self::build(participants, None)
    }

    /// Creates a barrier whose last arrival runs `action` once per phase.
    ///
    /// An `Err` returned by the action (or a panic out of it) is delivered as
    /// [`BarrierError::PostPhase`] to the thread that ran it and to every
    /// participant released by that phase. The phase still advances.
    pub fn with_post_phase<F>(participants: u32, action: F) -> Result<Self, BarrierError>
    where
        F: Fn(&Self) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync + 'static,
    {
        Self::build(participants, Some(Box::new(action)))
    }

    fn build(participants: u32, post_phase: Option<PostPhaseAction>) -> Result<Self, BarrierError> {
        if participants > MAX_PARTICIPANTS {
            return Err(BarrierError::InvalidParticipantCount(participants));
        }
        Ok(Self {
            state: StateCell::new(participants),
            phase: AtomicU64::new(0),
            // Phase 0 has even sense: its waiters block on the (unset) even
            // event. The odd event starts out set, matching the state a
            // finished odd phase would leave behind.
            even_event: ManualResetEvent::new(false),
            odd_event: ManualResetEvent::new(true),
            post_phase,
            action_caller: AtomicU64::new(0),
            outcomes: Mutex::new(PhaseOutcomes::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Number of registered participants.
    #[must_use]
    pub fn participant_count(&self) -> u32 {
        decode(self.state.load()).1
    }

    /// Number of registered participants that have not yet signaled the
    /// current phase.
    #[must_use]
    pub fn participants_remaining(&self) -> u32 {
        let (current, total, _) = decode(self.state.load());
        total - current
    }

    /// Number of the phase currently in progress.
    #[must_use]
    pub fn current_phase(&self) -> u64 {
        self.phase.load(Ordering::Acquire)
    }

    /// Registers one additional participant. See [`Self::add_participants`].
    pub fn add_participant(&self) -> Result<u64, BarrierError> {
        self.add_participants(1)
    }

    /// Registers `count` additional participants and returns the number of
    /// the first phase they take part in.
    ///
    /// If the current phase is just being finished, the call blocks until its
    /// event flip has landed, so the newcomers cannot race the release.
    pub fn add_participants(&self, count: u32) -> Result<u64, BarrierError> {
        self.ensure_not_disposed()?;
        if count == 0 {
            return Err(BarrierError::InvalidParticipantCount(0));
        }
        self.ensure_outside_post_phase()?;

        let mut backoff = Backoff::new();
        loop {
            let snapshot = self.state.load();
            let (current, total, sense) = decode(snapshot);
            if count > MAX_PARTICIPANTS - total {
                return Err(BarrierError::ParticipantLimitExceeded { added: count });
            }
            if !self.state.try_store(snapshot, current, total + count, sense) {
                backoff.spin();
                continue;
            }

            let observed_phase = self.current_phase();
            if sense == Sense::of_phase(observed_phase) {
                // Joining the current phase. Its release event may still be
                // set from the previous phase of the same sense when we land
                // in the window between the counter bump and the event flip;
                // reset it so the newcomers block properly.
                let event = self.event_for(sense);
                if event.is_set() {
                    event.reset();
                }
                return Ok(observed_phase);
            }
            // The current phase's last arrival has flipped the sense but not
            // yet advanced the counter. The newcomers first take part in the
            // next phase; hold them until the in-flight event flip lands.
            self.event_for(sense.flipped()).wait();
            return Ok(observed_phase + 1);
        }
    }

    /// Unregisters one participant. See [`Self::remove_participants`].
    pub fn remove_participant(&self) -> Result<(), BarrierError> {
        self.remove_participants(1)
    }

    /// Unregisters `count` participants that have not signaled the current
    /// phase.
    ///
    /// When the removal leaves exactly as many participants as have already
    /// arrived (and at least one), it completes the current phase in their
    /// stead, which runs the post-phase action and may surface its failure.
    pub fn remove_participants(&self, count: u32) -> Result<(), BarrierError> {
        self.ensure_not_disposed()?;
        if count == 0 {
            return Err(BarrierError::InvalidParticipantCount(0));
        }
        self.ensure_outside_post_phase()?;

        let mut backoff = Backoff::new();
        loop {
            let snapshot = self.state.load();
            let (current, total, sense) = decode(snapshot);
            if count > total {
                return Err(BarrierError::RemovalExceedsRegistered {
                    requested: count,
                    registered: total,
                });
            }
            let remaining = total - count;
            if remaining < current {
                return Err(BarrierError::RemovalBelowArrived {
                    remaining,
                    arrived: current,
                });
            }
            if remaining > 0 && current == remaining {
                // The removal stands in for the missing arrivals and
                // completes the current phase.
                if self.state.try_store(snapshot, 0, remaining, sense.flipped()) {
                    return self.finish_phase(sense);
                }
            } else if self.state.try_store(snapshot, current, remaining, sense) {
                return Ok(());
            }
            backoff.spin();
        }
    }

    /// Signals arrival and blocks until every other participant has signaled
    /// and the phase, including any post-phase action, has completed.
    pub fn signal_and_wait(&self) -> Result<(), BarrierError> {
        self.signal_and_wait_with(None, None).map(|_| ())
    }

    /// Like [`Self::signal_and_wait`], but gives up after `timeout`. Returns
    /// `Ok(false)` on timeout, with the arrival backed out so the phase can
    /// still be completed by the remaining participants.
    pub fn signal_and_wait_for(&self, timeout: Duration) -> Result<bool, BarrierError> {
        self.signal_and_wait_with(Some(timeout), None)
    }

    /// The general form of [`Self::signal_and_wait`]: an optional timeout
    /// (`None` blocks indefinitely) and an optional cancellation token.
    ///
    /// Cancellation or timeout striking exactly as the phase completes loses
    /// the race: the call then counts as a normal release and returns
    /// `Ok(true)`.
    pub fn signal_and_wait_with(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, BarrierError> {
        self.ensure_not_disposed()?;
        self.ensure_outside_post_phase()?;
        if let Some(token) = cancel {
            token.check()?;
        }

        let mut backoff = Backoff::new();
        let (sense, observed_phase) = loop {
            let snapshot = self.state.load();
            let (current, total, sense) = decode(snapshot);
            let observed_phase = self.current_phase();

            if total == 0 {
                return Err(BarrierError::NoParticipants);
            }
            if current == 0 && sense != Sense::of_phase(observed_phase) {
                // The previous phase's last arrival has flipped the sense but
                // not yet advanced the counter. Only a thread beyond the
                // registered count can arrive inside this window.
                return Err(BarrierError::ExcessSignalers);
            }
            if current + 1 == total {
                // Last arrival: reset the count, flip the sense, finish the
                // phase on this thread.
                if self.state.try_store(snapshot, 0, total, sense.flipped()) {
                    trace!("phase {observed_phase} finished (sense {sense:?})");
                    self.finish_phase(sense)?;
                    return Ok(true);
                }
            } else if self.state.try_store(snapshot, current + 1, total, sense) {
                break (sense, observed_phase);
            }
            backoff.spin();
        };

        let event = self.event_for(sense);
        let mut canceled = false;
        let released = match self.wait_released(event, timeout, cancel, observed_phase) {
            Ok(released) => released,
            Err(Canceled) => {
                canceled = true;
                false
            }
        };

        if !released {
            // Timeout or cancellation: back the arrival out, unless the
            // phase completed concurrently and the wait lost the race.
            backoff.reset();
            loop {
                let snapshot = self.state.load();
                let (current, total, new_sense) = decode(snapshot);
                if self.current_phase() != observed_phase || new_sense != sense {
                    // The phase finished anyway. Hold on until its event flip
                    // has landed, otherwise this thread could overrun into
                    // the next phase, then report a normal release.
                    self.wait_phase_flip(event, observed_phase);
                    break;
                }
                if self.state.try_store(snapshot, current - 1, total, sense) {
                    if canceled {
                        return Err(BarrierError::Canceled(Canceled));
                    }
                    return Ok(false);
                }
                backoff.spin();
            }
        }

        if let Some(failure) = self.failure_for(observed_phase) {
            return Err(BarrierError::PostPhase(failure));
        }
        Ok(true)
    }

    /// Waits on the phase's release event in bounded chunks, re-checking the
    /// phase counter in between. A waiter that oversleeps two phase flips
    /// finds its event reset again; the counter check catches that and turns
    /// the stale wakeup into a release.
    fn wait_released(
        &self,
        event: &ManualResetEvent,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
        observed_phase: u64,
    ) -> Result<bool, Canceled> {
        const INITIAL_CHUNK: Duration = Duration::from_millis(100);
        const MAX_CHUNK: Duration = Duration::from_secs(10);

        let mut chunk = INITIAL_CHUNK;
        let mut remaining = timeout;
        while observed_phase == self.current_phase() {
            let slice = remaining.map_or(chunk, |remaining| chunk.min(remaining));
            if event.wait_with(Some(slice), cancel)? {
                return Ok(true);
            }
            if let Some(left) = remaining {
                let left = left.saturating_sub(slice);
                if left.is_zero() {
                    return Ok(false);
                }
                remaining = Some(left);
            }
            chunk = (chunk * 2).min(MAX_CHUNK);
        }
        // The phase advanced while we slept: that is a release.
        Ok(true)
    }

    /// Spins until the release event of the just-completed phase is set, or
    /// until a later phase has completed as well (which resets it again).
    fn wait_phase_flip(&self, event: &ManualResetEvent, observed_phase: u64) {
        let mut backoff = Backoff::new();
        while !event.is_set() && self.current_phase() <= observed_phase + 1 {
            backoff.spin();
        }
    }

    /// Runs on the thread that completed the phase: executes the post-phase
    /// action, publishes its outcome, advances the phase counter and flips
    /// the events. The event flip happens even when the action fails.
    fn finish_phase(&self, observed_sense: Sense) -> Result<(), BarrierError> {
        let Some(action) = &self.post_phase else {
            self.set_reset_events(observed_sense);
            return Ok(());
        };

        // The counter still reads the phase being finished here; it only
        // advances in set_reset_events below.
        let completing = self.current_phase();
        self.action_caller
            .store(thread_id::current(), Ordering::Release);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| action(self)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(source)) => Some(PostPhaseError::new(source.into())),
            Err(payload) => Some(PostPhaseError::from_panic(payload.as_ref())),
        };
        self.outcomes
            .lock()
            .unwrap()
            .record(completing, failure.clone());
        self.action_caller.store(0, Ordering::Release);
        self.set_reset_events(observed_sense);

        match failure {
            Some(failure) => Err(BarrierError::PostPhase(failure)),
            None => Ok(()),
        }
    }

    /// Advances the phase counter, then flips the events. Resetting the next
    /// phase's event before setting the released one guarantees the first
    /// thread into the new phase finds its event unset.
    fn set_reset_events(&self, observed_sense: Sense) {
        self.phase.fetch_add(1, Ordering::AcqRel);
        match observed_sense {
            Sense::Even => {
                self.odd_event.reset();
                self.even_event.set();
            }
            Sense::Odd => {
                self.even_event.reset();
                self.odd_event.set();
            }
        }
    }

    /// Marks the barrier as disposed and releases both events.
    ///
    /// Disposal is not synchronized against concurrent operations; the caller
    /// must make sure no participant is still using the barrier. Subsequent
    /// operations fail with [`BarrierError::Disposed`].
    pub fn dispose(&self) -> Result<(), BarrierError> {
        self.ensure_outside_post_phase()?;
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.even_event.set();
            self.odd_event.set();
        }
        Ok(())
    }

    fn event_for(&self, sense: Sense) -> &ManualResetEvent {
        match sense {
            Sense::Even => &self.even_event,
            Sense::Odd => &self.odd_event,
        }
    }

    /// The post-phase failure of `phase`, if that phase failed and its
    /// outcome is still on record.
    fn failure_for(&self, phase: u64) -> Option<PostPhaseError> {
        self.outcomes.lock().unwrap().failure_of(phase)
    }

    fn ensure_not_disposed(&self) -> Result<(), BarrierError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(BarrierError::Disposed)
        } else {
            Ok(())
        }
    }

    fn ensure_outside_post_phase(&self) -> Result<(), BarrierError> {
        let caller = self.action_caller.load(Ordering::Acquire);
        if caller != 0 && caller == thread_id::current() {
            Err(BarrierError::CalledFromPostPhaseAction)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (current, total, sense) = decode(self.state.load());
        f.debug_struct("Barrier")
            .field("current", &current)
            .field("total", &total)
            .field("sense", &sense)
            .field("phase", &self.current_phase())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    fn spawn_signalers(
        barrier: &Arc<Barrier>,
        threads: usize,
        rounds: usize,
    ) -> Vec<thread::JoinHandle<Vec<Result<(), BarrierError>>>> {
        (0..threads)
            .map(|_| {
                let barrier = Arc::clone(barrier);
                thread::spawn(move || (0..rounds).map(|_| barrier.signal_and_wait()).collect())
            })
            .collect()
    }

    #[test]
    fn new_barrier_starts_at_phase_zero() {
        let barrier = Barrier::new(3).unwrap();
        check!(barrier.participant_count() == 3);
        check!(barrier.participants_remaining() == 3);
        check!(barrier.current_phase() == 0);
    }

    #[test]
    fn zero_participants_is_a_valid_construction() {
        let barrier = Barrier::new(0).unwrap();
        check!(barrier.participant_count() == 0);
        check!(matches!(
            barrier.signal_and_wait(),
            Err(BarrierError::NoParticipants)
        ));
    }

    #[test]
    fn participant_count_above_limit_is_rejected() {
        check!(Barrier::new(Barrier::MAX_PARTICIPANTS).is_ok());
        check!(matches!(
            Barrier::new(Barrier::MAX_PARTICIPANTS + 1),
            Err(BarrierError::InvalidParticipantCount(_))
        ));
    }

    #[test]
    fn full_barrier_rejects_additional_participants() {
        let barrier = Barrier::new(Barrier::MAX_PARTICIPANTS).unwrap();
        check!(matches!(
            barrier.add_participant(),
            Err(BarrierError::ParticipantLimitExceeded { added: 1 })
        ));
    }

    #[test]
    fn single_participant_runs_phases_alone() {
        let barrier = Barrier::new(1).unwrap();
        for round in 0..5 {
            check!(barrier.current_phase() == round);
            barrier.signal_and_wait().unwrap();
        }
        check!(barrier.current_phase() == 5);
    }

    #[test]
    fn two_thread_ping_pong() {
        let barrier = Arc::new(Barrier::new(2).unwrap());
        let workers = spawn_signalers(&barrier, 2, 5);
        for worker in workers {
            for outcome in worker.join().unwrap() {
                check!(outcome.is_ok());
            }
        }
        check!(barrier.current_phase() == 5);
        check!(barrier.participants_remaining() == 2);
    }

    #[test]
    fn post_phase_action_runs_once_per_phase() {
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = {
            let calls = Arc::clone(&calls);
            Arc::new(
                Barrier::with_post_phase(3, move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap(),
            )
        };

        let workers = spawn_signalers(&barrier, 3, 4);
        for worker in workers {
            for outcome in worker.join().unwrap() {
                check!(outcome.is_ok());
            }
        }
        check!(calls.load(Ordering::SeqCst) == 4);
        check!(barrier.current_phase() == 4);
    }

    #[test]
    fn failing_action_reaches_every_participant_and_phase_advances() {
        // Fails in phase 0, succeeds from phase 1 on.
        let barrier = Arc::new(
            Barrier::with_post_phase(3, |barrier| {
                if barrier.current_phase() == 0 {
                    Err("boom".into())
                } else {
                    Ok(())
                }
            })
            .unwrap(),
        );

        let workers = spawn_signalers(&barrier, 3, 1);
        for worker in workers {
            for outcome in worker.join().unwrap() {
                let error = outcome.unwrap_err();
                check!(matches!(&error, BarrierError::PostPhase(failure)
                    if failure.to_string() == "boom"));
            }
        }
        check!(barrier.current_phase() == 1);

        // The next phase succeeds and clears the carried failure.
        let workers = spawn_signalers(&barrier, 3, 1);
        for worker in workers {
            for outcome in worker.join().unwrap() {
                check!(outcome.is_ok());
            }
        }
        check!(barrier.current_phase() == 2);
    }

    #[test]
    fn phase_outcomes_are_keyed_by_phase() {
        let source: Box<dyn Error + Send + Sync> = "boom".into();
        let failure = PostPhaseError::new(source.into());

        let mut outcomes = PhaseOutcomes::new();
        outcomes.record(0, Some(failure));
        outcomes.record(1, None);
        check!(outcomes.failure_of(0).is_some());
        check!(outcomes.failure_of(1).is_none());

        // Only the two most recent phases stay on record.
        outcomes.record(2, None);
        check!(outcomes.failure_of(0).is_none());
        check!(outcomes.failure_of(2).is_none());
    }

    #[test]
    fn earlier_phase_failure_stays_on_record_after_a_later_success() {
        let barrier = Arc::new(
            Barrier::with_post_phase(2, |barrier| {
                if barrier.current_phase() == 0 {
                    Err("boom".into())
                } else {
                    Ok(())
                }
            })
            .unwrap(),
        );

        let workers = spawn_signalers(&barrier, 2, 2);
        for worker in workers {
            let outcomes = worker.join().unwrap();
            check!(matches!(&outcomes[0], Err(BarrierError::PostPhase(_))));
            check!(outcomes[1].is_ok());
        }

        // A waiter released from phase 0 that is only now catching up still
        // sees phase 0's failure, not phase 1's clean outcome.
        check!(barrier.failure_for(0).is_some());
        check!(barrier.failure_for(1).is_none());
    }

    #[test]
    fn panicking_action_behaves_like_a_failing_one() {
        let barrier = Arc::new(
            Barrier::with_post_phase(2, |barrier| {
                if barrier.current_phase() == 0 {
                    panic!("broke down");
                }
                Ok(())
            })
            .unwrap(),
        );

        let workers = spawn_signalers(&barrier, 2, 1);
        for worker in workers {
            for outcome in worker.join().unwrap() {
                let error = outcome.unwrap_err();
                check!(matches!(&error, BarrierError::PostPhase(failure)
                    if failure.to_string().contains("broke down")));
            }
        }
        // The events still flipped: the next phase works.
        check!(barrier.current_phase() == 1);
        let workers = spawn_signalers(&barrier, 2, 1);
        for worker in workers {
            check!(worker.join().unwrap().iter().all(Result::is_ok));
        }
    }

    #[test]
    fn add_participant_during_phase_joins_it() {
        let barrier = Arc::new(Barrier::new(2).unwrap());
        let early = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.signal_and_wait())
        };
        // Give the early arrival time to block.
        while barrier.participants_remaining() == 2 {
            thread::yield_now();
        }

        check!(barrier.add_participant().unwrap() == 0);

        let late = spawn_signalers(&barrier, 2, 1);
        check!(early.join().unwrap().is_ok());
        for worker in late {
            check!(worker.join().unwrap().iter().all(Result::is_ok));
        }
        check!(barrier.current_phase() == 1);
    }

    #[test]
    fn add_participant_during_action_waits_for_the_flip() {
        let action_started = Arc::new(AtomicBool::new(false));
        let barrier = {
            let action_started = Arc::clone(&action_started);
            Arc::new(
                Barrier::with_post_phase(2, move |_| {
                    action_started.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(300));
                    Ok(())
                })
                .unwrap(),
            )
        };
        let workers = spawn_signalers(&barrier, 2, 1);

        // Land inside the action: the sense has flipped, the counter not yet.
        while !action_started.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        let begin = Instant::now();
        let joining_phase = barrier.add_participant().unwrap();
        // The add blocked until the action finished and the events flipped.
        check!(joining_phase == 1);
        check!(barrier.current_phase() == 1);
        check!(begin.elapsed() >= Duration::from_millis(100));

        for worker in workers {
            check!(worker.join().unwrap().iter().all(Result::is_ok));
        }
    }

    #[test]
    fn timeout_backs_the_arrival_out() {
        let barrier = Barrier::new(2).unwrap();
        let begin = Instant::now();
        check!(matches!(
            barrier.signal_and_wait_for(Duration::from_millis(50)),
            Ok(false)
        ));
        check!(begin.elapsed() >= Duration::from_millis(50));
        check!(barrier.participants_remaining() == 2);
        check!(barrier.current_phase() == 0);
    }

    #[test]
    fn zero_timeout_with_missing_peer_returns_false() {
        let barrier = Barrier::new(2).unwrap();
        check!(matches!(barrier.signal_and_wait_for(Duration::ZERO), Ok(false)));
        check!(barrier.participants_remaining() == 2);
    }

    #[test]
    fn cancellation_wakes_the_waiter_and_backs_out() {
        let barrier = Arc::new(Barrier::new(2).unwrap());
        let token = CancellationToken::new();
        let waiter = {
            let barrier = Arc::clone(&barrier);
            let token = token.clone();
            thread::spawn(move || barrier.signal_and_wait_with(None, Some(&token)))
        };
        while barrier.participants_remaining() == 2 {
            thread::yield_now();
        }

        token.cancel();
        check!(matches!(
            waiter.join().unwrap(),
            Err(BarrierError::Canceled(_))
        ));
        check!(barrier.participants_remaining() == 2);
    }

    #[test]
    fn pre_canceled_token_fails_without_arriving() {
        let barrier = Barrier::new(2).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        check!(matches!(
            barrier.signal_and_wait_with(None, Some(&token)),
            Err(BarrierError::Canceled(_))
        ));
        check!(barrier.participants_remaining() == 2);
    }

    #[test]
    fn over_arrival_is_detected_inside_the_action_window() {
        let action_started = Arc::new(AtomicBool::new(false));
        let barrier = {
            let action_started = Arc::clone(&action_started);
            Arc::new(
                Barrier::with_post_phase(1, move |_| {
                    action_started.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(500));
                    Ok(())
                })
                .unwrap(),
            )
        };
        let only_participant = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.signal_and_wait())
        };
        // Wait until the lone participant is inside the action: the sense is
        // flipped while the phase counter still reads 0.
        while !action_started.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        check!(matches!(
            barrier.signal_and_wait(),
            Err(BarrierError::ExcessSignalers)
        ));
        check!(only_participant.join().unwrap().is_ok());
    }

    #[test]
    fn add_then_remove_restores_the_barrier() {
        let barrier = Barrier::new(4).unwrap();
        let phase_before = barrier.current_phase();
        check!(barrier.add_participants(3).unwrap() == phase_before);
        check!(barrier.participant_count() == 7);
        barrier.remove_participants(3).unwrap();
        check!(barrier.participant_count() == 4);
        check!(barrier.current_phase() == phase_before);
    }

    #[test]
    fn remove_rejects_bad_counts() {
        let barrier = Barrier::new(2).unwrap();
        check!(matches!(
            barrier.remove_participants(0),
            Err(BarrierError::InvalidParticipantCount(0))
        ));
        check!(matches!(
            barrier.remove_participants(3),
            Err(BarrierError::RemovalExceedsRegistered {
                requested: 3,
                registered: 2
            })
        ));
    }

    #[test]
    fn remove_cannot_orphan_arrived_participants() {
        let barrier = Arc::new(Barrier::new(2).unwrap());
        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.signal_and_wait())
        };
        while barrier.participants_remaining() == 2 {
            thread::yield_now();
        }

        check!(matches!(
            barrier.remove_participants(2),
            Err(BarrierError::RemovalBelowArrived {
                remaining: 0,
                arrived: 1
            })
        ));

        // Removing one is fine and completes the phase in our stead.
        barrier.remove_participant().unwrap();
        check!(waiter.join().unwrap().is_ok());
        check!(barrier.current_phase() == 1);
    }

    #[test]
    fn structural_calls_from_the_action_are_rejected() {
        let seen = Arc::new(AtomicUsize::new(0));
        let barrier = {
            let seen = Arc::clone(&seen);
            Arc::new(
                Barrier::with_post_phase(1, move |barrier| {
                    if matches!(
                        barrier.add_participant(),
                        Err(BarrierError::CalledFromPostPhaseAction)
                    ) {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    if matches!(
                        barrier.remove_participant(),
                        Err(BarrierError::CalledFromPostPhaseAction)
                    ) {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    if matches!(
                        barrier.signal_and_wait(),
                        Err(BarrierError::CalledFromPostPhaseAction)
                    ) {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    if matches!(
                        barrier.dispose(),
                        Err(BarrierError::CalledFromPostPhaseAction)
                    ) {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                })
                .unwrap(),
            )
        };

        barrier.signal_and_wait().unwrap();
        check!(seen.load(Ordering::SeqCst) == 4);
        // Outside the action the same calls work again.
        check!(barrier.dispose().is_ok());
    }

    #[test]
    fn disposed_barrier_rejects_operations() {
        let barrier = Barrier::new(2).unwrap();
        barrier.dispose().unwrap();
        check!(matches!(
            barrier.signal_and_wait(),
            Err(BarrierError::Disposed)
        ));
        check!(matches!(
            barrier.add_participant(),
            Err(BarrierError::Disposed)
        ));
        check!(matches!(
            barrier.remove_participant(),
            Err(BarrierError::Disposed)
        ));
        // Disposing again stays fine.
        barrier.dispose().unwrap();
    }
}
