//! Error types for txreap
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::types::{TxnId, TxnState};
use thiserror::Error;

/// Result type alias for txreap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the transaction coordinator and harness
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// begin() called on a handle that has already started
    #[error("transaction {0} already started")]
    AlreadyStarted(TxnId),

    /// Listener registration attempted outside the Active/Committing window
    #[error("cannot register listener: transaction {txn} is {state}")]
    TooLate {
        /// Transaction the registration targeted
        txn: TxnId,
        /// State the handle was observed in
        state: TxnState,
    },

    /// Commit lost the race against a forced rollback
    ///
    /// This is the expected outcome when the reaper wins: workers recover
    /// from it locally and log it, it is never fatal.
    #[error("transaction {0} was rolled back")]
    RolledBack(TxnId),

    /// Operation attempted in a state that does not permit it
    #[error("transaction {txn} is {state}: operation not valid in this state")]
    InvalidState {
        /// Transaction the operation targeted
        txn: TxnId,
        /// State the handle was observed in
        state: TxnState,
    },

    /// Domain-work collaborator failure
    ///
    /// Fatal: aborts the scenario.
    #[error("domain work failed: {0}")]
    Work(String),

    /// The reaper did not quiesce within the drain timeout at shutdown
    ///
    /// Logged by callers; never blocks process exit.
    #[error("reaper did not stop within {waited_ms}ms")]
    ReaperStopTimeout {
        /// How long the caller waited before giving up
        waited_ms: u64,
    },

    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}
