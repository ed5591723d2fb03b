//! Store facade.

use crate::config::{Config, Mode};
use crate::error::CoreResult;
use crate::state::Handle;
use crate::stats::{StatsSnapshot, StoreStats};
use crate::transaction::{self, Transaction};
use crate::types::{HandleId, SnapshotId, Timestamp};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct StoreShared {
    config: Config,
    /// Source of snapshot IDs and timestamps.
    clock: AtomicU64,
    next_handle: AtomicU64,
    /// Serializes rebase and apply.
    commit_lock: Mutex<()>,
    /// Acquisition timestamps of snapshots not yet archived, with counts.
    active: Mutex<BTreeMap<u64, usize>>,
    stats: StoreStats,
}

/// The transactional object store.
///
/// A store owns the logical clock, the commit critical section and the
/// statistics shared by all handles, transactions and caches created from
/// it. Cloning a store is cheap and yields the same store.
///
/// # Example
///
/// ```rust,ignore
/// use reflux_core::Store;
///
/// let store = Store::new();
/// let model = store.handle("DemoModel");
///
/// store.run("init", || {
///     model.set("url", "reactronic".to_string())?;
///     model.set("log", vec!["RTA".to_string()])
/// })?;
/// ```
#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
}

impl Store {
    /// Creates a store with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a store with custom configuration.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                config,
                clock: AtomicU64::new(100),
                next_handle: AtomicU64::new(1),
                commit_lock: Mutex::new(()),
                active: Mutex::new(BTreeMap::new()),
                stats: StoreStats::new(),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &StoreStats {
        &self.shared.stats
    }

    /// Creates a stateful object.
    pub fn handle(&self, hint: &str) -> Handle {
        self.handle_with_mode(hint, Mode::Stateful)
    }

    /// Creates an object whose fields are managed according to `mode`.
    pub fn handle_with_mode(&self, hint: &str, mode: Mode) -> Handle {
        let id = self.shared.next_handle.fetch_add(1, Ordering::Relaxed);
        Handle::new(self, HandleId::new(id), hint, mode)
    }

    /// Starts a new root transaction.
    ///
    /// The transaction stays open until [`Transaction::seal`] or
    /// [`Transaction::commit`] is called.
    pub fn transaction(&self, hint: &str) -> Transaction {
        Transaction::new(self, hint)
    }

    /// Runs `f` in the current transaction, or in a new one committed
    /// when `f` returns.
    pub fn run<T>(&self, hint: &str, f: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        transaction::run_as(self, hint, false, f)
    }

    /// Runs `f` in a new transaction even when one is current.
    pub fn run_separate<T>(&self, hint: &str, f: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        transaction::run_as(self, hint, true, f)
    }

    /// Runs an asynchronous body in a new transaction.
    ///
    /// The transaction commits after the future settles. When it is canceled
    /// with a retry target, `body` is called again against a fresh
    /// transaction once the target finishes.
    pub async fn run_async<T, F, Fut>(&self, hint: &str, body: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        transaction::autoretry(self.clone(), hint.to_string(), None, 0, body, |_| None, |_, _| {}).await
    }

    /// Draws a snapshot ID and timestamp and registers it as active.
    pub(crate) fn acquire(&self) -> (SnapshotId, Timestamp) {
        let _lock = self.shared.commit_lock.lock();
        let n = self.shared.clock.fetch_add(1, Ordering::AcqRel) + 1;
        *self.shared.active.lock().entry(n).or_insert(0) += 1;
        (SnapshotId::new(n), Timestamp::new(n))
    }

    /// Unregisters an active snapshot timestamp.
    pub(crate) fn release(&self, acquired: Timestamp) {
        let mut active = self.shared.active.lock();
        if let Some(count) = active.get_mut(&acquired.as_u64()) {
            *count -= 1;
            if *count == 0 {
                active.remove(&acquired.as_u64());
            }
        }
    }

    /// Returns the oldest timestamp an open snapshot may still read at.
    pub(crate) fn oldest_active(&self) -> Option<Timestamp> {
        self.shared
            .active
            .lock()
            .keys()
            .next()
            .map(|ts| Timestamp::new(*ts))
    }

    /// Draws a commit timestamp. Callers hold the commit lock.
    pub(crate) fn next_timestamp(&self) -> Timestamp {
        Timestamp::new(self.shared.clock.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub(crate) fn commit_lock(&self) -> MutexGuard<'_, ()> {
        self.shared.commit_lock.lock()
    }

    pub(crate) fn same(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.shared.config)
            .field("clock", &self.shared.clock.load(Ordering::Relaxed))
            .field("active", &self.shared.active.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_get_distinct_ids() {
        let store = Store::new();
        let a = store.handle("A");
        let b = store.handle("B");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.to_string(), format!("{} A", a.id()));
    }

    #[test]
    fn active_registry_tracks_snapshots() {
        let store = Store::new();
        assert!(store.oldest_active().is_none());
        let (_, t1) = store.acquire();
        let (_, t2) = store.acquire();
        assert!(t1 < t2);
        assert_eq!(store.oldest_active(), Some(t1));
        store.release(t1);
        assert_eq!(store.oldest_active(), Some(t2));
        store.release(t2);
        assert!(store.oldest_active().is_none());
    }

    #[test]
    fn run_commits_and_counts() {
        let store = Store::new();
        let model = store.handle("DemoModel");
        store.run("init", || model.set("url", "a".to_string())).unwrap();

        let stats = store.stats();
        assert_eq!(stats.transactions_started, 1);
        assert_eq!(stats.transactions_committed, 1);
        assert!(store.oldest_active().is_none());
    }

    #[test]
    fn nested_run_joins_current_transaction() {
        let store = Store::new();
        let model = store.handle("DemoModel");
        store
            .run("outer", || {
                model.set("x", 1_i32)?;
                store.run("inner", || model.set("y", 2_i32))
            })
            .unwrap();

        assert_eq!(store.stats().transactions_started, 1);
        assert_eq!(model.head().fields(), vec!["x", "y"]);
    }

    #[test]
    fn separate_run_commits_independently() {
        let store = Store::new();
        let model = store.handle("DemoModel");
        let result: CoreResult<()> = store.run("outer", || {
            store.run_separate("inner", || model.set("y", 2_i32))?;
            Err(crate::CoreError::failed("outer fails"))
        });

        assert!(result.is_err());
        assert_eq!(model.get::<i32>("y").unwrap(), 2);
        assert_eq!(store.stats().transactions_canceled, 1);
    }
}
