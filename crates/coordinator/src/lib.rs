//! Transaction coordination layer for txreap
//!
//! This crate implements the two actors whose interaction is under study:
//! - TransactionHandle: the per-transaction lifecycle state machine, with
//!   atomic compare-and-set transitions and phased completion listeners
//! - Reaper: the background monitor that force-rolls-back transactions
//!   past their deadline and later drives their completion callbacks
//!
//! plus the externally observable surface:
//! - AuditRegistry: the concurrent map of per-transaction auxiliary state
//!   whose leftover entries signal the leak
//! - CompletionListener: the callback contract registered against a handle
//!
//! The handle's atomic state word is the single point of synchronization
//! between a worker's in-flight commit and the reaper's forced rollback;
//! force always wins a simultaneous race against the commit re-check.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handle;
pub mod listener;
pub mod reaper;
pub mod registry;

pub use handle::{ListenerFailure, OutcomeRecord, TransactionHandle};
pub use listener::{ActionListener, AwaitOutcomeListener, CompletionListener};
pub use reaper::Reaper;
pub use registry::{AuditProcess, AuditRegistry};
