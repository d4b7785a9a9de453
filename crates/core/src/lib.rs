//! Core types for txreap
//!
//! This crate defines the foundational types used throughout the system:
//! - TxnId: Unique identifier for transactions
//! - TxnState: Transaction lifecycle state machine states
//! - TxnOutcome: Final disposition of a transaction
//! - CompletionPhase: When a completion listener fires
//! - Error: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::{CompletionPhase, TxnId, TxnOutcome, TxnState};
