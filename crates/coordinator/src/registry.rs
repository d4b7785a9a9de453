//! Audit registry: per-transaction auxiliary state
//!
//! A shared map from transaction identity to opaque auxiliary state.
//! Entries are inserted while the transaction does its work and are meant
//! to be removed by an after-completion listener; an entry whose
//! transaction is terminal but which is still present is a leak.
//!
//! The registry is first-class with a public insert/remove/size contract —
//! verification code reads it concurrently with the scenario.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use txreap_core::TxnId;

/// Opaque auxiliary state held for one transaction
///
/// The content is irrelevant to the race under study; its presence is what
/// gets tested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditProcess {
    /// Free-text description of the pending audit work
    pub note: String,
    /// When the entry was created
    pub created_at: DateTime<Utc>,
}

impl AuditProcess {
    /// Create an entry stamped with the current time
    pub fn new(note: impl Into<String>) -> Self {
        Self {
            note: note.into(),
            created_at: Utc::now(),
        }
    }
}

/// Concurrent registry of audit processes keyed by transaction identity
///
/// Safe for concurrent access from the worker, its completion listeners,
/// and verification code running outside the scenario.
#[derive(Debug, Default)]
pub struct AuditRegistry {
    entries: DashMap<TxnId, AuditProcess>,
}

impl AuditRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the entry for a transaction, returning any replaced entry
    pub fn insert(&self, txn: TxnId, process: AuditProcess) -> Option<AuditProcess> {
        self.entries.insert(txn, process)
    }

    /// Remove the entry for a transaction, returning it if present
    pub fn remove(&self, txn: &TxnId) -> Option<AuditProcess> {
        self.entries.remove(txn).map(|(_, process)| process)
    }

    /// Whether an entry exists for the transaction
    pub fn contains(&self, txn: &TxnId) -> bool {
        self.entries.contains_key(txn)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the transaction ids with live entries
    pub fn txn_ids(&self) -> Vec<TxnId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }
}
