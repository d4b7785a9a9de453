//! Core types for the transaction coordinator
//!
//! This module defines the foundational types:
//! - TxnId: Unique identifier for a transaction
//! - TxnState: Lifecycle states of a transaction handle
//! - TxnOutcome: Final disposition once a transaction is terminal
//! - CompletionPhase: Which phase a completion listener is registered for

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a transaction
///
/// A TxnId is a wrapper around a UUID v4, stable for the lifetime of its
/// handle. It keys external per-transaction state such as audit registry
/// entries, so identity must survive the handle reaching a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(Uuid);

impl TxnId {
    /// Create a new random TxnId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a TxnId from a string representation
    ///
    /// Accepts standard UUID format (with or without hyphens).
    ///
    /// # Errors
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a transaction handle
///
/// State transitions:
/// - `Idle` → `Active` (begin)
/// - `Active` → `Committing` (commit entry)
/// - `Committing` → `Committed` (commit re-check passed)
/// - `Active`/`Committing` → `RollingBack` → `RolledBack` (owner rollback)
/// - `Active`/`Committing` → `RolledBack` (forced by the reaper)
///
/// Terminal states (no transitions allowed):
/// - `Committed`
/// - `RolledBack`
///
/// The state is stored in an `AtomicU8` on the handle; the discriminant
/// values below are the wire format of that atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxnState {
    /// Handle created, begin() not yet called
    Idle = 0,
    /// Transaction is executing, can accept work and listeners
    Active = 1,
    /// Commit in progress, before-completion listeners may be running
    Committing = 2,
    /// Transaction committed successfully
    Committed = 3,
    /// Owner-initiated rollback in progress
    RollingBack = 4,
    /// Transaction was rolled back (by its owner or by the reaper)
    RolledBack = 5,
}

impl TxnState {
    /// Encode this state for atomic storage
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a state previously encoded with [`TxnState::as_u8`]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TxnState::Idle),
            1 => Some(TxnState::Active),
            2 => Some(TxnState::Committing),
            3 => Some(TxnState::Committed),
            4 => Some(TxnState::RollingBack),
            5 => Some(TxnState::RolledBack),
            _ => None,
        }
    }

    /// Check whether this state is terminal
    ///
    /// Terminal handles accept no further transitions or listener
    /// registrations.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::RolledBack)
    }

    /// The outcome implied by this state
    ///
    /// Non-terminal states map to [`TxnOutcome::Unknown`].
    pub fn outcome(self) -> TxnOutcome {
        match self {
            TxnState::Committed => TxnOutcome::Committed,
            TxnState::RolledBack => TxnOutcome::RolledBack,
            _ => TxnOutcome::Unknown,
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Final disposition of a transaction
///
/// Set exactly once when the transaction reaches a terminal state and
/// immutable thereafter. `Unknown` means the transaction has not yet been
/// decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnOutcome {
    /// The commit re-check passed and the transaction committed
    Committed,
    /// The transaction was rolled back, voluntarily or by force
    RolledBack,
    /// No terminal state reached yet
    Unknown,
}

/// Phase at which a completion listener fires
///
/// Before-completion listeners run inside commit, after the transition to
/// `Committing` and before the terminal re-check. After-completion
/// listeners run once the outcome is decided, at most once per handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionPhase {
    /// Runs during commit, before the outcome is decided
    BeforeCompletion,
    /// Runs once the outcome is decided
    AfterCompletion,
}
