//! Transactional worker
//!
//! Drives one end-to-end unit of work against a handle it owns: begin and
//! register with the reaper, perform and flush domain work, insert the
//! audit registry entry, register the completion listeners, commit. A
//! rollback raised by commit is the expected outcome and is recovered
//! here; anything else is fatal.
//!
//! Whatever happens, the worker releases its session and fires its
//! one-shot completion signal so the orchestrator's blocking wait always
//! returns. If the worker thread dies without reporting, the dropped
//! sender wakes the receiver just the same.

use crate::config::ScenarioConfig;
use crate::work::WorkSession;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use txreap_core::{CompletionPhase, Error, Result, TxnId, TxnOutcome};
use txreap_coordinator::{
    ActionListener, AuditProcess, AuditRegistry, AwaitOutcomeListener, ListenerFailure, Reaper,
    TransactionHandle,
};

/// What one worker run produced, delivered through the completion signal
#[derive(Debug, Clone)]
pub struct WorkerReport {
    /// Identity of the transaction the worker drove, once begun
    pub txn_id: Option<TxnId>,
    /// Final disposition of the transaction as the worker observed it
    pub outcome: TxnOutcome,
    /// Whether commit raised a rollback that the worker recovered from
    pub recovered_rollback: bool,
    /// Fatal error that aborted the run, if any
    pub fatal: Option<String>,
    /// Listener failures recorded on the handle
    pub listener_failures: Vec<ListenerFailure>,
}

impl WorkerReport {
    fn empty() -> Self {
        Self {
            txn_id: None,
            outcome: TxnOutcome::Unknown,
            recovered_rollback: false,
            fatal: None,
            listener_failures: Vec::new(),
        }
    }

    /// Report for a worker that died without sending one
    pub fn aborted() -> Self {
        Self {
            fatal: Some("worker terminated without reporting".to_string()),
            ..Self::empty()
        }
    }
}

/// Drives one transactional unit of work to completion
pub struct Worker {
    txn_timeout: Duration,
    wait_for_rollback: bool,
    poll_interval: Duration,
    registry: Arc<AuditRegistry>,
    reaper: Arc<Reaper>,
}

impl Worker {
    /// Create a worker wired to the shared registry and reaper
    pub fn new(config: &ScenarioConfig, registry: Arc<AuditRegistry>, reaper: Arc<Reaper>) -> Self {
        Self {
            txn_timeout: config.txn_timeout(),
            wait_for_rollback: config.wait_for_rollback,
            poll_interval: config.poll_interval(),
            registry,
            reaper,
        }
    }

    /// Run the unit of work, then release the session and signal completion
    ///
    /// Never panics outward on domain failures: fatal errors are recorded
    /// in the report. The signal fires on every path.
    pub fn run(self, mut session: Box<dyn WorkSession>, done: Sender<WorkerReport>) {
        let mut report = WorkerReport::empty();
        let result = self.execute(session.as_mut(), &mut report);
        session.close();
        if let Err(e) = result {
            error!(error = %e, "worker failed");
            report.fatal = Some(e.to_string());
        }
        let _ = done.send(report);
    }

    fn execute(&self, session: &mut dyn WorkSession, report: &mut WorkerReport) -> Result<()> {
        info!("starting transactional work");

        let txn = Arc::new(TransactionHandle::new(self.txn_timeout));
        txn.begin()?;
        report.txn_id = Some(txn.id());
        let deadline = txn.deadline().ok_or_else(|| Error::InvalidState {
            txn: txn.id(),
            state: txn.state(),
        })?;
        self.reaper.watch(&txn, deadline);

        // Work is flushed before any listener attaches; the audit entry
        // must exist by the time commit can run.
        let work = session.perform_work("audit trail for the current unit of work")?;
        session.flush(&work)?;
        self.registry.insert(
            txn.id(),
            AuditProcess::new("pending audit work for this transaction"),
        );

        // The correct pattern: release the registry entry on any outcome.
        let cleanup_registry = Arc::clone(&self.registry);
        let id = txn.id();
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            Arc::new(ActionListener::new("audit-cleanup", move |_| {
                cleanup_registry.remove(&id);
                debug!(txn = %id, "audit entry released");
                Ok(())
            })),
        )?;
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            Arc::new(ActionListener::new("completion-log", |outcome| {
                info!(?outcome, "completion callbacks reached");
                Ok(())
            })),
        )?;
        if self.wait_for_rollback {
            txn.register_listener(
                CompletionPhase::BeforeCompletion,
                Arc::new(AwaitOutcomeListener::new(
                    TxnOutcome::RolledBack,
                    self.poll_interval,
                )),
            )?;
        }

        match txn.commit() {
            Ok(()) => {
                report.outcome = TxnOutcome::Committed;
            }
            Err(Error::RolledBack(_)) => {
                info!("rollback was expected");
                report.outcome = TxnOutcome::RolledBack;
                report.recovered_rollback = true;
            }
            Err(e) => return Err(e),
        }
        report.listener_failures = txn.listener_failures();
        Ok(())
    }
}
