//! Background worker that batches change signals into dedup passes.
//!
//! Change signals only mark collections dirty. The worker waits until no new
//! signal arrived for the idle window, then takes the shared lock file and
//! runs one pass over everything marked so far. If the lock is busy the marks
//! are put back and the worker waits out another window.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::pass::{DedupReport, Deduplicator};
use crate::error::Result;
use crate::lock::{LockAttempt, LockFile};
use crate::media::{CollectionIndex, SharedIndex};

/// Holder name written into the lock file.
pub const LOCK_HOLDER: &str = "dedup";

/// Collections waiting for a pass.
#[derive(Debug, Default)]
struct DirtySet {
    all: bool,
    ids: BTreeSet<String>,
}

impl DirtySet {
    fn is_empty(&self) -> bool {
        !self.all && self.ids.is_empty()
    }

    fn take(&mut self, index: &CollectionIndex) -> BTreeSet<String> {
        let mut ids = std::mem::take(&mut self.ids);
        if std::mem::take(&mut self.all) {
            ids.extend(index.collection_ids());
        }
        ids
    }
}

/// Progress of the worker, published after every pass.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub passes: u64,
    pub deferred: u64,
    pub last_report: Option<DedupReport>,
}

struct Shared {
    dirty: Mutex<DirtySet>,
    wake: Notify,
    cancel: CancellationToken,
    state: watch::Sender<SchedulerState>,
}

impl Shared {
    fn dirty(&self) -> std::sync::MutexGuard<'_, DirtySet> {
        self.dirty.lock().expect("dirty set lock poisoned")
    }
}

/// Run one pass under the lock file.
///
/// Returns `Ok(None)` when another holder has the lock.
pub fn run_locked(
    dedup: &Deduplicator,
    index: &CollectionIndex,
    dirty: &BTreeSet<String>,
    lock: &LockFile,
    cancel: &CancellationToken,
) -> Result<Option<DedupReport>> {
    match lock.try_acquire(LOCK_HOLDER)? {
        LockAttempt::Acquired(_guard) => Ok(Some(dedup.run_once(index, dirty, cancel))),
        LockAttempt::Busy(holder) => {
            info!(?holder, "Lock held elsewhere, dedup pass deferred");
            Ok(None)
        }
    }
}

/// Handle to the background dedup worker.
pub struct DedupScheduler {
    shared: Arc<Shared>,
    state: watch::Receiver<SchedulerState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DedupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupScheduler")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl DedupScheduler {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(dedup: Deduplicator, index: SharedIndex, lock: LockFile, idle: Duration) -> Self {
        let (tx, rx) = watch::channel(SchedulerState::default());
        let shared = Arc::new(Shared {
            dirty: Mutex::new(DirtySet::default()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            state: tx,
        });
        let worker = Worker {
            shared: Arc::clone(&shared),
            dedup,
            index,
            lock,
            idle,
        };
        let handle = tokio::spawn(worker.run());
        info!(idle_secs = idle.as_secs_f64(), "Dedup scheduler started");
        Self {
            shared,
            state: rx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Mark one collection as changed and restart the idle window.
    pub fn mark_dirty(&self, collection: &str) {
        self.shared.dirty().ids.insert(collection.to_string());
        self.shared.wake.notify_one();
        debug!(collection, "Collection marked dirty");
    }

    /// Mark every collection as changed, as done on startup.
    pub fn mark_all(&self) {
        self.shared.dirty().all = true;
        self.shared.wake.notify_one();
        debug!("All collections marked dirty");
    }

    /// True when marks are waiting for a pass.
    pub fn has_pending(&self) -> bool {
        !self.shared.dirty().is_empty()
    }

    pub fn state(&self) -> SchedulerState {
        self.state.borrow().clone()
    }

    /// Receiver that changes after every pass or deferral.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Stop the worker. A pass in flight finishes its current file first.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let handle = self.handle.lock().expect("scheduler handle lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dedup worker ended abnormally");
            }
        }
        info!("Dedup scheduler stopped");
    }
}

impl Drop for DedupScheduler {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

struct Worker {
    shared: Arc<Shared>,
    dedup: Deduplicator,
    index: SharedIndex,
    lock: LockFile,
    idle: Duration,
}

impl Worker {
    async fn run(self) {
        let cancel = self.shared.cancel.clone();
        loop {
            if self.shared.dirty().is_empty() {
                tokio::select! {
                    () = self.shared.wake.notified() => {}
                    () = cancel.cancelled() => return,
                }
            }

            if !self.wait_idle(&cancel).await {
                return;
            }

            let index = self.index.current();
            let dirty = self.shared.dirty().take(&index);
            if dirty.is_empty() {
                continue;
            }
            self.pass(index, dirty, &cancel).await;
        }
    }

    /// Sleep until a full idle window passes without a new signal.
    async fn wait_idle(&self, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.idle) => return true,
                () = self.shared.wake.notified() => {
                    debug!("Change signal, idle window restarted");
                }
                () = cancel.cancelled() => return false,
            }
        }
    }

    #[instrument(skip_all, fields(collections = dirty.len()))]
    async fn pass(&self, index: Arc<CollectionIndex>, dirty: BTreeSet<String>, cancel: &CancellationToken) {
        let dedup = self.dedup.clone();
        let lock = self.lock.clone();
        let token = cancel.clone();
        let marks = dirty.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            run_locked(&dedup, &index, &marks, &lock, &token)
        })
        .await;

        let requeue = match outcome {
            Ok(Ok(Some(report))) => {
                let cancelled = report.cancelled;
                self.shared.state.send_modify(|s| {
                    s.passes += 1;
                    s.last_report = Some(report);
                });
                cancelled
            }
            Ok(Ok(None)) => {
                self.shared.state.send_modify(|s| s.deferred += 1);
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Dedup pass could not start");
                true
            }
            Err(e) => {
                warn!(error = %e, "Dedup pass panicked");
                true
            }
        };

        if requeue {
            self.shared.dirty().ids.extend(dirty);
        }
    }
}
