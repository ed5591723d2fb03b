//! Store statistics.
//!
//! Counters are updated by the transaction and cache machinery and can be
//! read at any time through [`Store::stats`](crate::Store::stats).
//!
//! ```rust,ignore
//! let store = Store::new();
//! store.run("init", || model.set("url", "a".to_string()))?;
//!
//! let stats = store.stats();
//! println!("Committed: {}", stats.transactions_committed);
//! println!("Conflicts: {}", stats.conflicts);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Store statistics.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct StoreStats {
    // Transaction counters
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_canceled: AtomicU64,
    conflicts: AtomicU64,
    retries: AtomicU64,

    // Cache counters
    cache_hits: AtomicU64,
    recomputations: AtomicU64,
    invalidations: AtomicU64,
    reactions: AtomicU64,
}

impl StoreStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_cancel(&self) {
        self.transactions_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recomputation(&self) {
        self.recomputations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_reaction(&self) {
        self.reactions.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions canceled, conflicts included.
    pub fn transactions_canceled(&self) -> u64 {
        self.transactions_canceled.load(Ordering::Relaxed)
    }

    /// Returns the total number of commits rejected by rebase.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Returns the total number of automatic re-executions.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Returns the total number of cache reads served without recomputation.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Returns the total number of cache computations.
    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::Relaxed)
    }

    /// Returns the total number of cache entries invalidated by commits.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Returns the total number of reaction transactions spawned.
    pub fn reactions(&self) -> u64 {
        self.reactions.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_canceled: self.transactions_canceled(),
            conflicts: self.conflicts(),
            retries: self.retries(),
            cache_hits: self.cache_hits(),
            recomputations: self.recomputations(),
            invalidations: self.invalidations(),
            reactions: self.reactions(),
        }
    }
}

/// A point-in-time snapshot of store statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Total number of transactions started.
    pub transactions_started: u64,
    /// Total number of transactions committed.
    pub transactions_committed: u64,
    /// Total number of transactions canceled.
    pub transactions_canceled: u64,
    /// Total number of commits rejected by rebase.
    pub conflicts: u64,
    /// Total number of automatic re-executions.
    pub retries: u64,
    /// Total number of cache hits.
    pub cache_hits: u64,
    /// Total number of cache computations.
    pub recomputations: u64,
    /// Total number of invalidated cache entries.
    pub invalidations: u64,
    /// Total number of reaction transactions.
    pub reactions: u64,
}
