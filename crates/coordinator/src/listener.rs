//! Completion listener contracts
//!
//! A completion listener is a callback registered against a transaction
//! handle for one of the two completion phases. The coordinator guarantees
//! registered listeners run at most once per handle, in registration order,
//! at their declared phase.
//!
//! Two concrete shapes cover what the harness needs: an unconditional
//! action, and a listener that blocks until the handle's outcome matches a
//! target. The blocking variant exists to hold the commit's
//! before-completion phase open while the reaper acts.

use crate::handle::TransactionHandle;
use std::thread;
use std::time::Duration;
use txreap_core::{Result, TxnOutcome};

/// A callback invoked at a completion phase of a transaction
///
/// Listeners receive the live handle rather than a snapshot: a
/// before-completion listener may need to observe state transitions made
/// by other actors while it runs, and an after-completion listener reads
/// the decided outcome from the handle.
pub trait CompletionListener: Send + Sync {
    /// Invoke the listener against the handle it was registered with
    ///
    /// # Errors
    /// Listener errors are isolated by the caller: they are recorded on the
    /// handle and do not prevent later listeners in the phase from running.
    fn invoke(&self, txn: &TransactionHandle) -> Result<()>;

    /// Short name used in logs and failure records
    fn name(&self) -> &str;
}

/// Listener that performs a fixed action with the handle's outcome
///
/// The action runs on any outcome. This is the shape cleanup listeners
/// take: release external state keyed by the transaction, whatever the
/// disposition was.
pub struct ActionListener<F>
where
    F: Fn(TxnOutcome) -> Result<()> + Send + Sync,
{
    name: String,
    action: F,
}

impl<F> ActionListener<F>
where
    F: Fn(TxnOutcome) -> Result<()> + Send + Sync,
{
    /// Create a named action listener
    pub fn new(name: impl Into<String>, action: F) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }
}

impl<F> CompletionListener for ActionListener<F>
where
    F: Fn(TxnOutcome) -> Result<()> + Send + Sync,
{
    fn invoke(&self, txn: &TransactionHandle) -> Result<()> {
        (self.action)(txn.outcome())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Listener that blocks until the handle's outcome matches a target
///
/// Polls the handle at a fixed interval. The wait has no upper bound:
/// registered as a before-completion listener, it holds the commit's race
/// window open until the awaited outcome arrives, however long that takes.
pub struct AwaitOutcomeListener {
    target: TxnOutcome,
    poll_interval: Duration,
}

impl AwaitOutcomeListener {
    /// Create a listener that waits for `target`, polling every `poll_interval`
    pub fn new(target: TxnOutcome, poll_interval: Duration) -> Self {
        Self {
            target,
            poll_interval,
        }
    }
}

impl CompletionListener for AwaitOutcomeListener {
    fn invoke(&self, txn: &TransactionHandle) -> Result<()> {
        tracing::info!(txn = %txn.id(), target = ?self.target, "before-completion listener waiting for outcome");
        while txn.outcome() != self.target {
            thread::sleep(self.poll_interval);
        }
        tracing::debug!(txn = %txn.id(), "awaited outcome observed");
        Ok(())
    }

    fn name(&self) -> &str {
        "await-outcome"
    }
}
