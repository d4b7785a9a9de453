//! Domain-work collaborator contract
//!
//! The scenario treats its persistence layer as opaque: the worker calls
//! `perform_work` and `flush` through a narrow trait and never sees what
//! is behind it. Failures surface as `Error::Work` and abort the scenario.

use tracing::debug;
use txreap_core::{Error, Result};

/// Opaque token for one unit of buffered domain work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkHandle(u64);

/// Collaborator that performs the transaction's domain work
///
/// Implementations must guarantee that work buffered by `perform_work`
/// becomes observable to the persistence layer on `flush`, and that
/// `close` releases whatever the session holds regardless of transaction
/// outcome.
pub trait WorkSession: Send {
    /// Buffer a unit of domain work, returning its token
    fn perform_work(&mut self, note: &str) -> Result<WorkHandle>;

    /// Flush a previously buffered unit of work
    fn flush(&mut self, work: &WorkHandle) -> Result<()>;

    /// Release session resources; idempotent
    fn close(&mut self);
}

/// In-memory work session backing the harness
///
/// Keeps simple bookkeeping so tests can assert the session was used and
/// released correctly.
#[derive(Debug, Default)]
pub struct InMemoryWorkSession {
    next_id: u64,
    pending: Vec<WorkHandle>,
    flushed: Vec<WorkHandle>,
    closed: bool,
}

impl InMemoryWorkSession {
    /// Create an open session with no buffered work
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flushed work units
    pub fn flushed_count(&self) -> usize {
        self.flushed.len()
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl WorkSession for InMemoryWorkSession {
    fn perform_work(&mut self, note: &str) -> Result<WorkHandle> {
        if self.closed {
            return Err(Error::Work("session is closed".to_string()));
        }
        self.next_id += 1;
        let handle = WorkHandle(self.next_id);
        self.pending.push(handle);
        debug!(work = self.next_id, note, "buffered domain work");
        Ok(handle)
    }

    fn flush(&mut self, work: &WorkHandle) -> Result<()> {
        if self.closed {
            return Err(Error::Work("session is closed".to_string()));
        }
        match self.pending.iter().position(|pending| pending == work) {
            Some(index) => {
                let handle = self.pending.remove(index);
                self.flushed.push(handle);
                Ok(())
            }
            None => Err(Error::Work(format!("unknown work handle {work:?}"))),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!(
                pending = self.pending.len(),
                flushed = self.flushed.len(),
                "work session closed"
            );
            self.pending.clear();
        }
    }
}
