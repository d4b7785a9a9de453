//! Background transaction reaper
//!
//! The reaper watches live transaction handles and enforces their
//! deadlines from its own thread, independent of whatever the owning
//! worker is doing. Cancellation is two-stage:
//!
//! 1. **Cancel**: a watched handle past its deadline gets
//!    `force_rollback()` — an immediate atomic transition that wins
//!    against any in-flight commit that has not passed its re-check.
//! 2. **Completion**: once the cancel-wait period has elapsed and the
//!    worker's before-completion phase has exited, the reaper drives the
//!    handle's after-completion listeners. Until then the cancelled
//!    transaction sits in the reaper's completion queue; a reaper stopped
//!    (or configured with a pathological cancel-wait) before this stage
//!    abandons the queue, and any cleanup those listeners would have done
//!    never happens.
//!
//! The scan loop never holds a lock shared with a committing worker:
//! handles to act on are collected under the watch-set lock and acted on
//! after it is released, so a before-completion listener blocking for
//! minutes cannot deadlock the reaper — only race it.

use crate::handle::TransactionHandle;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use txreap_core::{Error, Result, TxnId};

struct WatchEntry {
    handle: Weak<TransactionHandle>,
    deadline: Instant,
}

struct CancelledEntry {
    // Owned from cancel to completion: the reaper seized the transaction
    // and must be able to finish it after the worker has moved on.
    handle: Arc<TransactionHandle>,
    cancelled_at: Instant,
}

struct ReaperInner {
    watch_set: Mutex<HashMap<TxnId, WatchEntry>>,
    cancelled: Mutex<HashMap<TxnId, CancelledEntry>>,
    tick: Condvar,
    done: Mutex<bool>,
    done_cv: Condvar,
    shutdown: AtomicBool,
    scan_interval: Duration,
    cancel_wait: Duration,
}

/// Background monitor that force-rolls-back transactions past their deadline
///
/// Watches handles through weak references; the watch set never keeps a
/// finished transaction alive. `force_rollback` calls are serialized
/// per-handle by the handle's own compare-and-set transition; distinct
/// handles may be cancelled concurrently with anything else the process is
/// doing.
pub struct Reaper {
    inner: Arc<ReaperInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    /// Create a reaper with the given scan interval and cancel-wait period
    pub fn new(scan_interval: Duration, cancel_wait: Duration) -> Self {
        Self {
            inner: Arc::new(ReaperInner {
                watch_set: Mutex::new(HashMap::new()),
                cancelled: Mutex::new(HashMap::new()),
                tick: Condvar::new(),
                done: Mutex::new(false),
                done_cv: Condvar::new(),
                shutdown: AtomicBool::new(false),
                scan_interval,
                cancel_wait,
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start the scan loop on its own named thread
    ///
    /// A second call, or a call after `stop`, is a logged no-op.
    pub fn start(&self) {
        let mut slot = self.thread.lock();
        if slot.is_some() || self.inner.shutdown.load(Ordering::Acquire) {
            warn!("reaper already started or stopped");
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("txreap-reaper".to_string())
            .spawn(move || scan_loop(&inner))
            .expect("failed to spawn reaper thread");
        *slot = Some(handle);
        info!(
            scan_interval_ms = self.inner.scan_interval.as_millis() as u64,
            cancel_wait_ms = self.inner.cancel_wait.as_millis() as u64,
            "reaper started"
        );
    }

    /// Watch a transaction until the given deadline
    ///
    /// The reaper holds only a weak reference while watching; a handle
    /// dropped by its owner is pruned on the next scan.
    pub fn watch(&self, handle: &Arc<TransactionHandle>, deadline: Instant) {
        let id = handle.id();
        self.inner.watch_set.lock().insert(
            id,
            WatchEntry {
                handle: Arc::downgrade(handle),
                deadline,
            },
        );
        debug!(txn = %id, "watching transaction");
    }

    /// Stop watching a transaction
    ///
    /// Only affects the watch stage: a transaction the reaper has already
    /// cancelled stays queued for its completion stage.
    pub fn unwatch(&self, txn: &TxnId) {
        if self.inner.watch_set.lock().remove(txn).is_some() {
            debug!(txn = %txn, "unwatched transaction");
        }
    }

    /// Number of handles currently in the watch stage
    pub fn watched_count(&self) -> usize {
        self.inner.watch_set.lock().len()
    }

    /// Number of cancelled handles awaiting their completion stage
    pub fn cancelled_count(&self) -> usize {
        self.inner.cancelled.lock().len()
    }

    /// Stop the scan loop
    ///
    /// Signals shutdown, then waits up to `drain_timeout` for an in-flight
    /// scan pass (including any forced rollback it is performing) to
    /// finish before joining the thread. Once this returns `Ok`, no
    /// further forced rollbacks occur. Cancelled transactions still
    /// awaiting their completion stage are abandoned — their
    /// after-completion listeners never run.
    ///
    /// # Errors
    /// `Error::ReaperStopTimeout` if the loop does not quiesce within
    /// `drain_timeout`; the thread is left detached and the error is
    /// informational.
    pub fn stop(&self, drain_timeout: Duration) -> Result<()> {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            // Lock before notifying so a scanner between its shutdown
            // check and the condvar wait cannot miss the wakeup.
            let _watch = self.inner.watch_set.lock();
            self.inner.tick.notify_all();
        }

        let thread = self.thread.lock().take();
        let Some(thread) = thread else {
            return Ok(());
        };

        let deadline = Instant::now() + drain_timeout;
        {
            let mut done = self.inner.done.lock();
            while !*done {
                let now = Instant::now();
                if now >= deadline {
                    warn!(
                        waited_ms = drain_timeout.as_millis() as u64,
                        "reaper did not quiesce within the drain timeout"
                    );
                    return Err(Error::ReaperStopTimeout {
                        waited_ms: drain_timeout.as_millis() as u64,
                    });
                }
                let _ = self.inner.done_cv.wait_for(&mut done, deadline - now);
            }
        }
        let _ = thread.join();

        let abandoned = self.inner.cancelled.lock().len();
        if abandoned > 0 {
            warn!(
                abandoned,
                "reaper stopped with cancelled transactions awaiting completion"
            );
        }
        info!("reaper stopped");
        Ok(())
    }
}

fn scan_loop(inner: &ReaperInner) {
    loop {
        {
            let mut watch_set = inner.watch_set.lock();
            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
            let _ = inner.tick.wait_for(&mut watch_set, inner.scan_interval);
            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
        }
        scan_once(inner);
    }

    let mut done = inner.done.lock();
    *done = true;
    inner.done_cv.notify_all();
}

fn scan_once(inner: &ReaperInner) {
    // Stage 1: cancel watched handles past their deadline.
    let now = Instant::now();
    let mut due = Vec::new();
    {
        let mut watch_set = inner.watch_set.lock();
        watch_set.retain(|id, entry| match entry.handle.upgrade() {
            None => {
                debug!(txn = %id, "watched handle dropped, pruning");
                false
            }
            Some(handle) => {
                if handle.state().is_terminal() {
                    false
                } else if now >= entry.deadline {
                    due.push((*id, handle));
                    false
                } else {
                    true
                }
            }
        });
    }

    for (id, handle) in due {
        if handle.force_rollback() {
            info!(txn = %id, "deadline elapsed, transaction cancelled");
            inner.cancelled.lock().insert(
                id,
                CancelledEntry {
                    handle,
                    cancelled_at: Instant::now(),
                },
            );
        }
        // A false return means the worker reached a terminal state first;
        // the entry is already out of the watch set.
    }

    // Stage 2: drive completion for cancelled handles whose cancel-wait
    // has elapsed and whose commit has quiesced.
    let ready: Vec<(TxnId, Arc<TransactionHandle>)> = {
        let mut cancelled = inner.cancelled.lock();
        let now = Instant::now();
        let ready_ids: Vec<TxnId> = cancelled
            .iter()
            .filter(|(_, entry)| {
                now >= entry.cancelled_at + inner.cancel_wait
                    && !entry.handle.before_phase_active()
            })
            .map(|(id, _)| *id)
            .collect();
        ready_ids
            .into_iter()
            .filter_map(|id| cancelled.remove(&id).map(|entry| (id, entry.handle)))
            .collect()
    };

    for (id, handle) in ready {
        if handle.run_after_completion() {
            info!(txn = %id, "after-completion driven for cancelled transaction");
        } else {
            debug!(txn = %id, "completion already driven elsewhere");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ActionListener;
    use std::sync::atomic::AtomicUsize;
    use txreap_core::{CompletionPhase, TxnState};

    const SCAN: Duration = Duration::from_millis(5);

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn begun_handle(timeout: Duration) -> Arc<TransactionHandle> {
        let txn = Arc::new(TransactionHandle::new(timeout));
        txn.begin().unwrap();
        txn
    }

    #[test]
    fn test_forces_rollback_after_deadline() {
        let reaper = Reaper::new(SCAN, Duration::from_secs(600));
        reaper.start();

        let txn = begun_handle(Duration::from_millis(20));
        reaper.watch(&txn, txn.deadline().unwrap());

        assert!(wait_until(Duration::from_secs(2), || {
            txn.state() == TxnState::RolledBack
        }));
        assert!(txn.outcome_record().unwrap().forced);

        reaper.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_committed_handle_is_pruned_not_forced() {
        let reaper = Reaper::new(SCAN, Duration::from_secs(600));
        reaper.start();

        let txn = begun_handle(Duration::from_millis(30));
        reaper.watch(&txn, txn.deadline().unwrap());
        txn.commit().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            reaper.watched_count() == 0
        }));
        assert_eq!(txn.state(), TxnState::Committed);

        reaper.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_unwatch_prevents_forcing() {
        let reaper = Reaper::new(SCAN, Duration::from_secs(600));
        reaper.start();

        let txn = begun_handle(Duration::from_millis(20));
        reaper.watch(&txn, txn.deadline().unwrap());
        reaper.unwatch(&txn.id());

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(txn.state(), TxnState::Active);

        reaper.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_dropped_handle_is_pruned() {
        let reaper = Reaper::new(SCAN, Duration::from_secs(600));
        reaper.start();

        let txn = begun_handle(Duration::from_secs(60));
        reaper.watch(&txn, txn.deadline().unwrap());
        assert_eq!(reaper.watched_count(), 1);
        drop(txn);

        assert!(wait_until(Duration::from_secs(2), || {
            reaper.watched_count() == 0
        }));

        reaper.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_completion_stage_runs_after_cancel_wait() {
        let reaper = Reaper::new(SCAN, Duration::from_millis(20));
        reaper.start();

        let txn = begun_handle(Duration::from_millis(20));
        let after_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&after_runs);
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            Arc::new(ActionListener::new("counter", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        )
        .unwrap();
        reaper.watch(&txn, txn.deadline().unwrap());

        assert!(wait_until(Duration::from_secs(2), || {
            after_runs.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(reaper.cancelled_count(), 0);

        reaper.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_pathological_cancel_wait_defers_completion() {
        let reaper = Reaper::new(SCAN, Duration::from_secs(600));
        reaper.start();

        let txn = begun_handle(Duration::from_millis(20));
        let after_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&after_runs);
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            Arc::new(ActionListener::new("counter", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        )
        .unwrap();
        reaper.watch(&txn, txn.deadline().unwrap());

        assert!(wait_until(Duration::from_secs(2), || {
            txn.state() == TxnState::RolledBack
        }));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(after_runs.load(Ordering::SeqCst), 0);
        assert_eq!(reaper.cancelled_count(), 1);

        // Stopping abandons the pending completion for good.
        reaper.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(after_runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_idle_reaper() {
        let reaper = Reaper::new(SCAN, Duration::from_secs(600));
        reaper.start();
        reaper.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_stop_without_start() {
        let reaper = Reaper::new(SCAN, Duration::from_secs(600));
        reaper.stop(Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_no_forcing_after_stop() {
        let reaper = Reaper::new(SCAN, Duration::from_secs(600));
        reaper.start();
        reaper.stop(Duration::from_secs(1)).unwrap();

        let txn = begun_handle(Duration::from_millis(10));
        reaper.watch(&txn, txn.deadline().unwrap());
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(txn.state(), TxnState::Active);
    }

    #[test]
    fn test_stop_times_out_on_wedged_completion_listener() {
        let reaper = Reaper::new(SCAN, Duration::ZERO);
        reaper.start();

        let txn = begun_handle(Duration::from_millis(10));
        txn.register_listener(
            CompletionPhase::AfterCompletion,
            Arc::new(ActionListener::new("wedge", |_| {
                std::thread::sleep(Duration::from_secs(2));
                Ok(())
            })),
        )
        .unwrap();
        reaper.watch(&txn, txn.deadline().unwrap());

        // Wait for the scan thread to enter the wedged listener.
        assert!(wait_until(Duration::from_secs(2), || {
            txn.state() == TxnState::RolledBack
        }));
        std::thread::sleep(Duration::from_millis(30));

        let err = reaper.stop(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::ReaperStopTimeout { .. }));
    }
}
