//! txreap — a transaction-coordination harness that reproduces the
//! reaper-vs-commit completion race and its audit-registry leak.
//!
//! A [`TransactionHandle`] is driven through begin → commit by a worker
//! while a background [`Reaper`] force-rolls-back any transaction past its
//! deadline. Per-transaction auxiliary state lives in an [`AuditRegistry`]
//! and is released by an after-completion listener; when the reaper seizes
//! a transaction mid-commit, that listener can be left unexecuted and the
//! registry entry leaks.
//!
//! # Quick Start
//!
//! ```ignore
//! use txreap::{Orchestrator, ScenarioConfig};
//!
//! // The leaking configuration: 10ms scans, 300s cancel-wait,
//! // 5s transaction timeout, blocking before-completion listener.
//! let orchestrator = Orchestrator::init(ScenarioConfig::leaking())?;
//! let report = orchestrator.run_scenario()?;
//!
//! println!("{}", report.summary_line());
//! assert!(report.leak_detected());
//! ```
//!
//! The scenario wiring lives in `txreap-harness`; the state machine,
//! reaper, and registry live in `txreap-coordinator`.

// Re-export the public API from txreap-harness
pub use txreap_harness::*;
