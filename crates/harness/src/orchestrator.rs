//! Scenario orchestration
//!
//! The orchestrator owns the process-wide pieces — audit registry, reaper,
//! and the lookup that hands them out — with an explicit lifecycle instead
//! of ambient statics: `init` wires everything, `run_scenario` executes
//! one scenario to completion and tears the reaper down, and the returned
//! [`ScenarioReport`] is the externally observable surface.
//!
//! Sequencing per run: start the reaper, spawn the worker, block on the
//! worker's one-shot completion signal, stop the reaper with the
//! configured drain timeout, then read the registry. A nonzero registry
//! size at that point is the leak.

use crate::config::ScenarioConfig;
use crate::work::{InMemoryWorkSession, WorkSession};
use crate::worker::{Worker, WorkerReport};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};
use txreap_core::{Error, Result, TxnId};
use txreap_coordinator::{AuditRegistry, Reaper};

/// Resolves the process-wide coordinator pieces
///
/// One synchronous resolution at startup; everything the scenario needs is
/// reachable from here afterwards.
pub struct Lookup {
    registry: Arc<AuditRegistry>,
    reaper: Arc<Reaper>,
}

impl Lookup {
    /// Construct the shared registry and reaper from the configuration
    pub fn resolve(config: &ScenarioConfig) -> Self {
        Self {
            registry: Arc::new(AuditRegistry::new()),
            reaper: Arc::new(Reaper::new(config.scan_interval(), config.cancel_wait())),
        }
    }

    /// The shared audit registry
    pub fn registry(&self) -> &Arc<AuditRegistry> {
        &self.registry
    }

    /// The shared reaper
    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }
}

/// Final state of a completed scenario
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    /// Audit registry size after shutdown; nonzero signals the leak
    pub audit_len: usize,
    /// Transactions whose registry entries survived
    pub leaked: Vec<TxnId>,
    /// What the worker reported through its completion signal
    pub worker: WorkerReport,
    /// Whether stopping the reaper exceeded the drain timeout
    pub reaper_stop_timed_out: bool,
}

impl ScenarioReport {
    /// The report line a human or harness reads to spot the leak
    pub fn summary_line(&self) -> String {
        format!("Size of auditProcesses (expected: 0): {}", self.audit_len)
    }

    /// Whether any registry entry outlived its transaction
    pub fn leak_detected(&self) -> bool {
        self.audit_len > 0
    }
}

/// Wires worker, reaper, and registry, and runs one scenario to completion
///
/// One orchestrator runs one scenario: `run_scenario` stops the reaper on
/// the way out, so a fresh orchestrator is needed for a fresh run.
pub struct Orchestrator {
    config: ScenarioConfig,
    lookup: Lookup,
}

impl Orchestrator {
    /// Validate the configuration and resolve the shared pieces
    ///
    /// # Errors
    /// `Error::Config` if the configuration fails validation.
    pub fn init(config: ScenarioConfig) -> Result<Self> {
        config.validate()?;
        let lookup = Lookup::resolve(&config);
        Ok(Self { config, lookup })
    }

    /// The lookup owning the shared registry and reaper
    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    /// Run the scenario against the in-memory work session
    pub fn run_scenario(&self) -> Result<ScenarioReport> {
        self.run_scenario_with(Box::new(InMemoryWorkSession::new()))
    }

    /// Run the scenario against a caller-supplied work session
    pub fn run_scenario_with(&self, session: Box<dyn WorkSession>) -> Result<ScenarioReport> {
        let registry = Arc::clone(self.lookup.registry());
        let reaper = Arc::clone(self.lookup.reaper());
        reaper.start();

        let (done_tx, done_rx) = mpsc::channel();
        let worker = Worker::new(&self.config, Arc::clone(&registry), Arc::clone(&reaper));
        let worker_thread = thread::Builder::new()
            .name("txreap-worker".to_string())
            .spawn(move || worker.run(session, done_tx))
            .expect("failed to spawn worker thread");

        // Blocking join on the one-shot signal. A worker that dies without
        // reporting drops its sender, so recv cannot wait forever.
        let worker_report = match done_rx.recv() {
            Ok(report) => report,
            Err(_) => {
                error!("worker exited without reporting");
                WorkerReport::aborted()
            }
        };
        let _ = worker_thread.join();

        let reaper_stop_timed_out = match reaper.stop(self.config.drain_timeout()) {
            Ok(()) => false,
            Err(e @ Error::ReaperStopTimeout { .. }) => {
                warn!(error = %e, "continuing shutdown despite reaper drain timeout");
                true
            }
            Err(e) => return Err(e),
        };

        let report = ScenarioReport {
            audit_len: registry.len(),
            leaked: registry.txn_ids(),
            worker: worker_report,
            reaper_stop_timed_out,
        };
        info!("{}", report.summary_line());
        Ok(report)
    }
}
