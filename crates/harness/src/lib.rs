//! Scenario harness for txreap
//!
//! Wires the coordination layer into a runnable scenario: a [`Worker`]
//! drives one transaction while the shared [`Reaper`] enforces its
//! deadline, and the [`Orchestrator`] owns the lifecycle and reports the
//! final [`AuditRegistry`] state. The configuration decides whether the
//! run demonstrates the leak or the correct cleanup path.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod orchestrator;
pub mod work;
pub mod worker;

pub use config::ScenarioConfig;
pub use orchestrator::{Lookup, Orchestrator, ScenarioReport};
pub use work::{InMemoryWorkSession, WorkHandle, WorkSession};
pub use worker::{Worker, WorkerReport};

// Re-export the coordination and core surface the harness exposes
pub use txreap_coordinator::{
    ActionListener, AuditProcess, AuditRegistry, AwaitOutcomeListener, CompletionListener,
    ListenerFailure, OutcomeRecord, Reaper, TransactionHandle,
};
pub use txreap_core::{CompletionPhase, Error, Result, TxnId, TxnOutcome, TxnState};
