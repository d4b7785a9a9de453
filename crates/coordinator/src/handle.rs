//! Transaction handle state machine
//!
//! A `TransactionHandle` owns the lifecycle of one logical transaction.
//! Its state lives in a single `AtomicU8`; every transition is a
//! compare-and-set on that word, which makes it the only synchronization
//! point between the worker driving commit and the reaper forcing
//! rollback. Exactly one of {commit's terminal re-check, force_rollback}
//! can win a simultaneous race, and the tie-break is defined: force wins
//! against any commit that has not yet passed its re-check.
//!
//! Completion listeners are phased. Before-completion listeners run inside
//! `commit()`, after the `Active → Committing` transition and before the
//! terminal re-check; each may block indefinitely, and nothing they block
//! on is locked by the reaper. After-completion listeners run at most once
//! per handle, driven by whichever actor owns completion at the time the
//! outcome is decided:
//!
//! - commit owns completion when it reaches a terminal state itself
//!   (successful commit, or rollback observed at entry before the
//!   before-completion phase started);
//! - the reaper owns completion when its forced rollback lands mid-commit,
//!   and drives the after-completion chain on its own schedule (see
//!   `reaper::Reaper`). A reaper that never gets there leaves the chain
//!   unexecuted — the leak this crate exists to demonstrate.

use crate::listener::CompletionListener;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use txreap_core::{CompletionPhase, Error, Result, TxnId, TxnOutcome, TxnState};

/// Record of the decided outcome, set exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeRecord {
    /// The decided outcome
    pub outcome: TxnOutcome,
    /// Whether the deciding transition was a reaper-forced rollback
    pub forced: bool,
}

/// A listener that failed or panicked during a completion phase
///
/// Failures are isolated per listener and surfaced in the final scenario
/// report; they never stop later listeners in the same phase.
#[derive(Debug, Clone)]
pub struct ListenerFailure {
    /// Phase the listener was registered for
    pub phase: CompletionPhase,
    /// The listener's name
    pub listener: String,
    /// Rendered error or panic message
    pub error: String,
}

/// The state machine for one logical transaction
///
/// Owned by the worker that created it (via `Arc`) until terminal; the
/// reaper holds only a `Weak` reference and mutates state exclusively
/// through [`TransactionHandle::force_rollback`].
pub struct TransactionHandle {
    id: TxnId,
    timeout: Duration,
    state: AtomicU8,
    deadline: OnceCell<Instant>,
    listeners: Mutex<Vec<(CompletionPhase, Arc<dyn CompletionListener>)>>,
    outcome_record: OnceCell<OutcomeRecord>,
    after_fired: AtomicBool,
    before_phase_active: AtomicBool,
    failures: Mutex<Vec<ListenerFailure>>,
}

/// RAII flag for the before-completion phase
///
/// The reaper refuses to drive after-completion while this flag is up, so
/// it must come down even if a listener panics.
struct PhaseGuard<'a>(&'a AtomicBool);

impl<'a> PhaseGuard<'a> {
    fn arm(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl<'a> Drop for PhaseGuard<'a> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn decode(value: u8) -> TxnState {
    TxnState::from_u8(value).unwrap_or_else(|| unreachable!("invalid state encoding: {value}"))
}

impl TransactionHandle {
    /// Create a handle in the `Idle` state with the given timeout
    ///
    /// The deadline is computed when [`begin`](Self::begin) runs, not here.
    pub fn new(timeout: Duration) -> Self {
        Self {
            id: TxnId::new(),
            timeout,
            state: AtomicU8::new(TxnState::Idle.as_u8()),
            deadline: OnceCell::new(),
            listeners: Mutex::new(Vec::new()),
            outcome_record: OnceCell::new(),
            after_fired: AtomicBool::new(false),
            before_phase_active: AtomicBool::new(false),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// This transaction's identity, stable for the handle's lifetime
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// The configured timeout for this transaction
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current lifecycle state
    pub fn state(&self) -> TxnState {
        decode(self.state.load(Ordering::Acquire))
    }

    /// Absolute deadline after which the reaper may force rollback
    ///
    /// None until `begin()` has run.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.get().copied()
    }

    /// The decided outcome, or `Unknown` while the transaction is live
    pub fn outcome(&self) -> TxnOutcome {
        self.outcome_record
            .get()
            .map(|r| r.outcome)
            .unwrap_or_else(|| self.state().outcome())
    }

    /// The full outcome record, if the transaction has been decided
    pub fn outcome_record(&self) -> Option<OutcomeRecord> {
        self.outcome_record.get().copied()
    }

    /// Listener failures recorded so far, in occurrence order
    pub fn listener_failures(&self) -> Vec<ListenerFailure> {
        self.failures.lock().clone()
    }

    fn transition(&self, from: TxnState, to: TxnState) -> std::result::Result<(), TxnState> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(decode)
    }

    fn record_outcome(&self, outcome: TxnOutcome, forced: bool) {
        let _ = self.outcome_record.get_or_init(|| OutcomeRecord { outcome, forced });
    }

    /// Start the transaction: `Idle → Active`
    ///
    /// Sets the deadline from the configured timeout.
    ///
    /// # Errors
    /// `Error::AlreadyStarted` if `begin` was already called on this handle.
    pub fn begin(&self) -> Result<()> {
        self.transition(TxnState::Idle, TxnState::Active)
            .map_err(|_| Error::AlreadyStarted(self.id))?;
        let _ = self.deadline.set(Instant::now() + self.timeout);
        debug!(txn = %self.id, timeout_ms = self.timeout.as_millis() as u64, "transaction started");
        Ok(())
    }

    /// Register a completion listener for the given phase
    ///
    /// Listeners fire at most once, in registration order within their
    /// phase. Registration is only valid while the handle is `Active` or
    /// `Committing`.
    ///
    /// # Errors
    /// `Error::TooLate` once the handle has left the registration window —
    /// never a silent success.
    pub fn register_listener(
        &self,
        phase: CompletionPhase,
        listener: Arc<dyn CompletionListener>,
    ) -> Result<()> {
        // The state can move to terminal between this check and the push;
        // that is fine: listeners registered in the window still only run
        // through the exactly-once completion paths below.
        match self.state() {
            TxnState::Active | TxnState::Committing => {
                self.listeners.lock().push((phase, listener));
                Ok(())
            }
            state => Err(Error::TooLate { txn: self.id, state }),
        }
    }

    /// Attempt to commit: `Active → Committing → Committed`
    ///
    /// Runs before-completion listeners in registration order between the
    /// two transitions; each may block indefinitely. The terminal re-check
    /// after the before-completion phase is where a reaper-forced rollback
    /// is discovered.
    ///
    /// # Errors
    /// - `Error::RolledBack` when the transaction was forced (or rolled
    ///   back) before or during the commit. If the rollback predates the
    ///   commit, the after-completion listeners run here with the rollback
    ///   outcome; if it landed mid-commit, completion belongs to the
    ///   forcing actor and this call drives nothing further.
    /// - `Error::InvalidState` when called before `begin` or after a
    ///   previous terminal transition.
    pub fn commit(&self) -> Result<()> {
        match self.transition(TxnState::Active, TxnState::Committing) {
            Ok(()) => {}
            Err(TxnState::RollingBack) | Err(TxnState::RolledBack) => {
                self.record_outcome(TxnOutcome::RolledBack, false);
                let _ = self.transition(TxnState::RollingBack, TxnState::RolledBack);
                debug!(txn = %self.id, "commit refused: transaction already rolled back");
                self.run_after_completion();
                return Err(Error::RolledBack(self.id));
            }
            Err(state) => return Err(Error::InvalidState { txn: self.id, state }),
        }

        {
            let _guard = PhaseGuard::arm(&self.before_phase_active);
            self.invoke_phase(CompletionPhase::BeforeCompletion);
        }

        match self.transition(TxnState::Committing, TxnState::Committed) {
            Ok(()) => {
                self.record_outcome(TxnOutcome::Committed, false);
                info!(txn = %self.id, "transaction committed");
                self.run_after_completion();
                Ok(())
            }
            Err(observed) => {
                // The forcing actor owns completion from here.
                warn!(txn = %self.id, state = %observed, "commit lost to a forced rollback");
                Err(Error::RolledBack(self.id))
            }
        }
    }

    /// Owner-initiated rollback: `Active|Committing → RollingBack → RolledBack`
    ///
    /// Runs after-completion listeners with the rollback outcome.
    ///
    /// # Errors
    /// `Error::InvalidState` on `Idle` or terminal handles.
    pub fn rollback(&self) -> Result<()> {
        loop {
            let current = self.state();
            match current {
                TxnState::Active | TxnState::Committing => {
                    if self.transition(current, TxnState::RollingBack).is_ok() {
                        break;
                    }
                }
                state => return Err(Error::InvalidState { txn: self.id, state }),
            }
        }
        self.record_outcome(TxnOutcome::RolledBack, false);
        let _ = self.transition(TxnState::RollingBack, TxnState::RolledBack);
        info!(txn = %self.id, "transaction rolled back");
        self.run_after_completion();
        Ok(())
    }

    /// Reaper-only forced rollback: `Active|Committing → RolledBack`
    ///
    /// Immediate and atomic, independent of any in-flight `commit()` on
    /// another thread. No-op on `Idle`, `RollingBack`, or terminal
    /// handles. Returns whether this call won the transition — at most one
    /// caller ever does.
    pub fn force_rollback(&self) -> bool {
        loop {
            let current = self.state();
            match current {
                TxnState::Active | TxnState::Committing => {
                    if self.transition(current, TxnState::RolledBack).is_ok() {
                        self.record_outcome(TxnOutcome::RolledBack, true);
                        warn!(txn = %self.id, was = %current, "forced rollback");
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Whether a commit's before-completion phase is currently running
    ///
    /// The reaper defers its completion stage until this is false.
    pub(crate) fn before_phase_active(&self) -> bool {
        self.before_phase_active.load(Ordering::Acquire)
    }

    /// Run the after-completion listener chain, at most once per handle
    ///
    /// Shared exactly-once guard across every completion owner: commit,
    /// owner rollback, and the reaper's deferred completion stage.
    pub(crate) fn run_after_completion(&self) -> bool {
        if self
            .after_fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.invoke_phase(CompletionPhase::AfterCompletion);
        true
    }

    fn invoke_phase(&self, phase: CompletionPhase) {
        let listeners: Vec<Arc<dyn CompletionListener>> = {
            let registrations = self.listeners.lock();
            registrations
                .iter()
                .filter(|(p, _)| *p == phase)
                .map(|(_, l)| Arc::clone(l))
                .collect()
        };

        for listener in listeners {
            // catch_unwind keeps one misbehaving listener from taking the
            // rest of the phase down with it.
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener.invoke(self)));
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(format!(
                    "panicked: {}",
                    panic
                        .downcast_ref::<&str>()
                        .copied()
                        .unwrap_or("(non-string panic)")
                )),
            };
            if let Some(message) = failure {
                error!(
                    txn = %self.id,
                    listener = listener.name(),
                    phase = ?phase,
                    error = %message,
                    "completion listener failed"
                );
                self.failures.lock().push(ListenerFailure {
                    phase,
                    listener: listener.name().to_string(),
                    error: message,
                });
            }
        }
    }
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ActionListener;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_listener(counter: &Arc<AtomicUsize>) -> Arc<dyn CompletionListener> {
        let counter = Arc::clone(counter);
        Arc::new(ActionListener::new("counter", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn recording_listener(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn CompletionListener> {
        let log = Arc::clone(log);
        Arc::new(ActionListener::new(name, move |_| {
            log.lock().push(name);
            Ok(())
        }))
    }

    #[test]
    fn test_begin_transitions_to_active() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        assert_eq!(txn.state(), TxnState::Idle);
        assert!(txn.deadline().is_none());
        txn.begin().unwrap();
        assert_eq!(txn.state(), TxnState::Active);
        assert!(txn.deadline().is_some());
    }

    #[test]
    fn test_begin_twice_fails() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        txn.begin().unwrap();
        let err = txn.begin().unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted(id) if id == txn.id()));
    }

    #[test]
    fn test_commit_before_begin_fails() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        let err = txn.commit().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: TxnState::Idle,
                ..
            }
        ));
    }

    #[test]
    fn test_commit_happy_path() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        txn.begin().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        txn.register_listener(
            CompletionPhase::BeforeCompletion,
            recording_listener("before", &log),
        )
        .unwrap();
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            recording_listener("after", &log),
        )
        .unwrap();

        txn.commit().unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(txn.outcome(), TxnOutcome::Committed);
        assert_eq!(*log.lock(), vec!["before", "after"]);
    }

    #[test]
    fn test_after_listeners_run_in_registration_order() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        txn.begin().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            recording_listener("first", &log),
        )
        .unwrap();
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            recording_listener("second", &log),
        )
        .unwrap();

        txn.commit().unwrap();
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_force_before_commit_runs_after_listeners() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        txn.begin().unwrap();

        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_clone = Arc::clone(&observed);
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            Arc::new(ActionListener::new("observe", move |outcome| {
                observed_clone.lock().push(outcome);
                Ok(())
            })),
        )
        .unwrap();

        assert!(txn.force_rollback());
        let err = txn.commit().unwrap_err();
        assert!(matches!(err, Error::RolledBack(_)));
        assert_eq!(txn.state(), TxnState::RolledBack);
        assert_eq!(*observed.lock(), vec![TxnOutcome::RolledBack]);
    }

    #[test]
    fn test_force_mid_commit_skips_after_listeners() {
        // A before-completion listener that forces rollback reproduces the
        // reaper landing inside the race window, deterministically.
        let txn = Arc::new(TransactionHandle::new(Duration::from_secs(5)));
        txn.begin().unwrap();

        let after_runs = Arc::new(AtomicUsize::new(0));
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            counting_listener(&after_runs),
        )
        .unwrap();
        txn.register_listener(
            CompletionPhase::BeforeCompletion,
            Arc::new(ActionListener::new("seize", {
                let txn = Arc::clone(&txn);
                move |_| {
                    assert!(txn.force_rollback());
                    Ok(())
                }
            })),
        )
        .unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, Error::RolledBack(_)));
        assert_eq!(txn.outcome(), TxnOutcome::RolledBack);
        // Completion was seized mid-commit: commit drives nothing further.
        assert_eq!(after_runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_register_on_terminal_fails() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        txn.begin().unwrap();
        txn.commit().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let err = txn
            .register_listener(CompletionPhase::AfterCompletion, counting_listener(&counter))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TooLate {
                state: TxnState::Committed,
                ..
            }
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_force_rollback_idempotent() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        txn.begin().unwrap();

        let after_runs = Arc::new(AtomicUsize::new(0));
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            counting_listener(&after_runs),
        )
        .unwrap();

        assert!(txn.force_rollback());
        assert!(!txn.force_rollback());
        assert_eq!(txn.state(), TxnState::RolledBack);

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, Error::RolledBack(_)));
        assert_eq!(after_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_force_rollback_noop_after_commit() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        txn.begin().unwrap();
        txn.commit().unwrap();
        assert!(!txn.force_rollback());
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(txn.outcome(), TxnOutcome::Committed);
    }

    #[test]
    fn test_owner_rollback() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        txn.begin().unwrap();

        let after_runs = Arc::new(AtomicUsize::new(0));
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            counting_listener(&after_runs),
        )
        .unwrap();

        txn.rollback().unwrap();
        assert_eq!(txn.state(), TxnState::RolledBack);
        assert_eq!(txn.outcome(), TxnOutcome::RolledBack);
        assert_eq!(after_runs.load(Ordering::SeqCst), 1);

        let err = txn.rollback().unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        // A late commit settles on the same rollback without re-firing.
        assert!(matches!(txn.commit().unwrap_err(), Error::RolledBack(_)));
        assert_eq!(after_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_outcome_record_marks_forced() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        txn.begin().unwrap();
        txn.force_rollback();
        let record = txn.outcome_record().unwrap();
        assert_eq!(record.outcome, TxnOutcome::RolledBack);
        assert!(record.forced);

        let voluntary = TransactionHandle::new(Duration::from_secs(5));
        voluntary.begin().unwrap();
        voluntary.rollback().unwrap();
        assert!(!voluntary.outcome_record().unwrap().forced);
    }

    #[test]
    fn test_failing_listener_does_not_stop_phase() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        txn.begin().unwrap();

        txn.register_listener(
            CompletionPhase::AfterCompletion,
            Arc::new(ActionListener::new("broken", |_| {
                Err(Error::Work("listener exploded".to_string()))
            })),
        )
        .unwrap();
        let after_runs = Arc::new(AtomicUsize::new(0));
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            counting_listener(&after_runs),
        )
        .unwrap();

        txn.commit().unwrap();
        assert_eq!(after_runs.load(Ordering::SeqCst), 1);

        let failures = txn.listener_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].listener, "broken");
        assert!(failures[0].error.contains("listener exploded"));
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let txn = TransactionHandle::new(Duration::from_secs(5));
        txn.begin().unwrap();

        txn.register_listener(
            CompletionPhase::BeforeCompletion,
            Arc::new(ActionListener::new("panicky", |_| -> Result<()> {
                panic!("intentional test panic");
            })),
        )
        .unwrap();
        let after_runs = Arc::new(AtomicUsize::new(0));
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            counting_listener(&after_runs),
        )
        .unwrap();

        txn.commit().unwrap();
        assert_eq!(after_runs.load(Ordering::SeqCst), 1);

        let failures = txn.listener_failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.contains("panicked"));
    }

    // ========================================================================
    // Property tests
    // ========================================================================

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Commit,
        Rollback,
        Force,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Commit), Just(Op::Rollback), Just(Op::Force)]
    }

    proptest! {
        /// Any serial sequence of commit/rollback/force leaves the handle
        /// in a legal terminal state with after-completion fired at most
        /// once, and the outcome record matching the state.
        #[test]
        fn prop_transition_sequences_stay_legal(ops in proptest::collection::vec(op_strategy(), 1..8)) {
            let txn = TransactionHandle::new(Duration::from_secs(5));
            txn.begin().unwrap();

            let after_runs = Arc::new(AtomicUsize::new(0));
            txn.register_listener(
                CompletionPhase::AfterCompletion,
                counting_listener(&after_runs),
            )
            .unwrap();

            for op in &ops {
                match op {
                    Op::Commit => { let _ = txn.commit(); }
                    Op::Rollback => { let _ = txn.rollback(); }
                    Op::Force => { let _ = txn.force_rollback(); }
                }
            }

            let state = txn.state();
            prop_assert!(state.is_terminal());
            prop_assert!(after_runs.load(Ordering::SeqCst) <= 1);
            let record = txn.outcome_record();
            prop_assert!(record.is_some());
            prop_assert_eq!(record.unwrap().outcome, state.outcome());
        }
    }
}
