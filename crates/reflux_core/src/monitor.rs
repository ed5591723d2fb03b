//! Busy/idle bookkeeping of asynchronous calls.
//!
//! A [`Monitor`] counts the asynchronous cache calls configured to report to
//! it. It is busy from the first entry until the last worker leaves; with a
//! `delay_before_idle`, going idle is deferred and canceled by any entry
//! within the delay, so back-to-back calls never flicker the busy flag.
//!
//! The busy flag, the worker count and the worker list live on a stateful
//! handle of the monitor's store, written by standalone transactions. Cache
//! computations reading them are invalidated when they change.
//!
//! ```rust,ignore
//! let loading = Monitor::new(&store, "loading").delay_before_idle(Duration::from_millis(100));
//! let load = AsyncCached::with_options(
//!     &model,
//!     "load",
//!     CacheOptions::action().monitor(loading.clone()),
//!     move |url: String| async move { /* ... */ Ok(()) },
//! );
//! let label = Cached::new(&view, "label", move |_: &()| {
//!     Ok(if loading.is_busy() { "loading..." } else { "ready" })
//! });
//! ```

use crate::cache::reentrance::{self, RunSlot};
use crate::error::{CoreError, CoreResult};
use crate::state::Handle;
use crate::store::Store;
use crate::transaction::{standalone, Transaction};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{trace, warn};

/// One active asynchronous operation.
#[derive(Clone)]
pub struct Worker {
    id: u64,
    hint: String,
    run: Option<Arc<Mutex<RunSlot>>>,
}

impl Worker {
    /// Returns the worker ID, unique within its monitor.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns what the worker is running.
    #[must_use]
    pub fn hint(&self) -> &str {
        &self.hint
    }

    /// Returns the transaction of the call, once it has started.
    ///
    /// Always `None` for workers entered by hand.
    #[must_use]
    pub fn transaction(&self) -> Option<Transaction> {
        self.run.as_ref().and_then(|run| run.lock().transaction.clone())
    }

    /// Returns true if the call was canceled or superseded.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.run.as_ref().is_some_and(|run| {
            let run = run.lock();
            run.canceled.is_some() || run.transaction.as_ref().is_some_and(Transaction::is_canceled)
        })
    }

    /// Returns true once the call's transaction has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.transaction().is_some_and(|t| t.is_finished())
    }

    /// Cancels the call. A call that has not started yet is canceled as
    /// soon as its transaction is created.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Some(run) = &self.run {
            reentrance::cancel(run, reason.into());
        }
    }

    /// Waits until the call's transaction has finished.
    ///
    /// Resolves immediately for workers without a started transaction.
    pub async fn when_finished(&self) -> CoreResult<()> {
        match self.transaction() {
            Some(transaction) => transaction.when_finished(false).await,
            None => Ok(()),
        }
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.hint == other.hint
    }
}

impl Eq for Worker {}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("hint", &self.hint)
            .field("transaction", &self.transaction().map(|t| t.id()))
            .finish()
    }
}

#[derive(Default)]
struct MonitorState {
    busy: bool,
    next_id: u64,
    workers: BTreeMap<u64, Worker>,
    /// Bumped by every entry and reset; a deferred reset only applies if
    /// the generation it was scheduled in is still current.
    idle_generation: u64,
    /// Bumped by every change; the handle is only written forward.
    version: u64,
}

struct MonitorInner {
    hint: String,
    handle: Handle,
    delay_before_idle: Option<Duration>,
    state: Mutex<MonitorState>,
}

impl MonitorInner {
    fn reset_if_idle(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.idle_generation != generation || !state.workers.is_empty() {
                return;
            }
            state.busy = false;
            state.version += 1;
        }
        trace!(monitor = %self.hint, "monitor idle");
        self.publish();
    }

    /// Copies the bookkeeping onto the handle, writing changed fields only.
    fn publish(&self) {
        let store = self.handle.store().clone();
        let hint = format!("{}.publish", self.hint);
        loop {
            let (version, busy, workers) = {
                let state = self.state.lock();
                (state.version, state.busy, state.workers.values().cloned().collect::<Vec<_>>())
            };
            let published = standalone(&store, &hint, || {
                if self.handle.get::<u64>("version").unwrap_or(0) >= version {
                    return Ok(());
                }
                self.handle.set("version", version)?;
                if self.handle.get::<bool>("busy").ok() != Some(busy) {
                    self.handle.set("busy", busy)?;
                }
                if self.handle.get::<usize>("worker_count").ok() != Some(workers.len()) {
                    self.handle.set("worker_count", workers.len())?;
                }
                if self.handle.get::<Vec<Worker>>("workers").ok().as_ref() != Some(&workers) {
                    self.handle.set("workers", workers)?;
                }
                Ok(())
            });
            match published {
                Err(error) if error.is_conflict() => continue,
                Err(error) => {
                    warn!(monitor = %self.hint, error = %error, "monitor state not published");
                    return;
                }
                Ok(()) => return,
            }
        }
    }
}

/// Tracks concurrently active asynchronous workers.
///
/// Cloning a monitor is cheap and yields the same monitor.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    /// Creates an idle monitor that goes idle as soon as the last worker leaves.
    pub fn new(store: &Store, hint: impl Into<String>) -> Self {
        let hint = hint.into();
        Self {
            inner: Arc::new(MonitorInner {
                handle: store.handle(&hint),
                hint,
                delay_before_idle: None,
                state: Mutex::new(MonitorState::default()),
            }),
        }
    }

    /// Returns a new monitor that stays busy for `delay` after the last
    /// worker leaves.
    #[must_use]
    pub fn delay_before_idle(self, delay: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                hint: self.inner.hint.clone(),
                handle: self.inner.handle.clone(),
                delay_before_idle: Some(delay),
                state: Mutex::new(MonitorState::default()),
            }),
        }
    }

    /// Returns the human-readable label.
    #[must_use]
    pub fn hint(&self) -> &str {
        &self.inner.hint
    }

    /// Returns the handle holding the published state.
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Registers a worker and marks the monitor busy.
    pub fn enter(&self, hint: impl Into<String>) -> Worker {
        self.admit(hint.into(), None)
    }

    fn admit(&self, hint: String, run: Option<Arc<Mutex<RunSlot>>>) -> Worker {
        let worker = {
            let mut state = self.inner.state.lock();
            state.next_id += 1;
            let worker = Worker {
                id: state.next_id,
                hint,
                run,
            };
            state.workers.insert(worker.id, worker.clone());
            state.idle_generation += 1;
            state.busy = true;
            state.version += 1;
            trace!(monitor = %self.inner.hint, worker = %worker.hint, count = state.workers.len(), "worker entered");
            worker
        };
        self.inner.publish();
        worker
    }

    /// Unregisters a worker.
    ///
    /// When the last worker leaves, the monitor goes idle immediately or,
    /// with a delay configured, after the delay unless another worker enters.
    pub fn leave(&self, worker: &Worker) {
        let deferred = {
            let mut state = self.inner.state.lock();
            if state.workers.remove(&worker.id).is_none() {
                return;
            }
            state.version += 1;
            match self.inner.delay_before_idle {
                Some(delay) if state.workers.is_empty() => Some((delay, state.idle_generation)),
                None if state.workers.is_empty() => {
                    state.busy = false;
                    trace!(monitor = %self.inner.hint, "monitor idle");
                    None
                }
                _ => None,
            }
        };
        self.inner.publish();
        if let Some((delay, generation)) = deferred {
            schedule_reset(Arc::downgrade(&self.inner), delay, generation);
        }
    }

    /// Marks the monitor idle.
    ///
    /// Fails while workers are active.
    pub fn reset(&self) -> CoreResult<()> {
        {
            let mut state = self.inner.state.lock();
            if !state.workers.is_empty() {
                return Err(CoreError::misuse("cannot reset monitor having active workers"));
            }
            state.busy = false;
            state.idle_generation += 1;
            state.version += 1;
        }
        self.inner.publish();
        Ok(())
    }

    /// Returns true while workers are active or going idle is deferred.
    ///
    /// Reads the handle, so a cache computation calling this is
    /// invalidated when the flag changes.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.handle.get::<bool>("busy").unwrap_or(false)
    }

    /// Returns the number of active workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.handle.get::<usize>("worker_count").unwrap_or(0)
    }

    /// Returns the active workers in entry order.
    #[must_use]
    pub fn workers(&self) -> Vec<Worker> {
        self.inner.handle.get::<Vec<Worker>>("workers").unwrap_or_default()
    }
}

fn schedule_reset(inner: Weak<MonitorInner>, delay: Duration, generation: u64) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = inner.upgrade() {
                    inner.reset_if_idle(generation);
                }
            });
        }
        Err(_) => {
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                if let Some(inner) = inner.upgrade() {
                    inner.reset_if_idle(generation);
                }
            });
        }
    }
}

/// Keeps the worker of an asynchronous call registered until dropped.
pub(crate) struct WorkerGuard {
    monitor: Monitor,
    worker: Worker,
}

impl WorkerGuard {
    pub fn enter(monitor: &Monitor, hint: &str, run: Option<Arc<Mutex<RunSlot>>>) -> Self {
        Self {
            worker: monitor.admit(hint.to_string(), run),
            monitor: monitor.clone(),
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.monitor.leave(&self.worker);
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Monitor")
            .field("hint", &self.inner.hint)
            .field("busy", &state.busy)
            .field("workers", &state.workers.len())
            .field("delay_before_idle", &self.inner.delay_before_idle)
            .finish()
    }
}
