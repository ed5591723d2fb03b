//! Dependency-tracked caches.
//!
//! A cache entry memoizes one method of one handle. While the method runs,
//! every field it reads is recorded; a later commit that changes one of
//! those fields invalidates the entry, and invalidation cascades to entries
//! that read it. Triggers re-run themselves after invalidation, inside the
//! reaction of the invalidating transaction.
//!
//! - [`Cached`] wraps synchronous methods, actions and triggers.
//! - [`AsyncCached`] wraps asynchronous ones; overlapping calls follow the
//!   entry's [`Reentrance`](crate::Reentrance) policy.
//! - [`Cache`] is the view of an entry: validity, options, run phase.

mod async_cached;
mod cached;
pub(crate) mod cell;
pub(crate) mod observer;
pub(crate) mod reentrance;
pub(crate) mod trigger;

pub use async_cached::{AsyncCached, Invocation};
pub use cached::Cached;
pub use cell::Phase;

use crate::config::CacheOptions;
use crate::state::Handle;
use crate::store::Store;
use crate::transaction::{outside, Transaction};
use cell::CacheCell;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// The view of one cache entry.
#[derive(Clone)]
pub struct Cache {
    cell: Arc<CacheCell>,
}

impl Cache {
    pub(crate) fn new(cell: Arc<CacheCell>) -> Self {
        Self { cell }
    }

    /// Returns the entry name, e.g. `#23 DemoView.render`.
    #[must_use]
    pub fn hint(&self) -> &str {
        self.cell.hint()
    }

    /// Returns true if the entry holds no result valid for new callers.
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.cell.is_invalid()
    }

    /// Invalidates the current result; a trigger re-runs.
    pub fn invalidate(&self) {
        let mut invalidated = Vec::new();
        self.cell.invalidate(self.cell.generation(), &mut invalidated);
        trigger::schedule(self.cell.store(), invalidated);
    }

    /// Returns the entry's options.
    #[must_use]
    pub fn options(&self) -> CacheOptions {
        self.cell.options()
    }

    /// Changes the entry's options.
    ///
    /// ```rust,ignore
    /// load.cache().configure(|o| o.reentrance(Reentrance::CancelPrevious));
    /// ```
    pub fn configure(&self, f: impl FnOnce(CacheOptions) -> CacheOptions) {
        self.cell.configure(f);
    }

    /// Returns the run phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.cell.phase()
    }

    /// Returns the run phase, resetting a finished or canceled phase to idle.
    pub fn observe(&self) -> Phase {
        self.cell.observe()
    }

    /// Returns true while asynchronous calls are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.cell.phase() == Phase::Running
    }

    /// Releases every cache entry of `handles`.
    ///
    /// Entries drop their results, stop re-running and cascade
    /// invalidation to entries that read them. Returns the transaction that
    /// carries the teardown; it is sealed, and its reaction re-runs triggers
    /// affected by the removal.
    pub fn unmount(store: &Store, handles: &[&Handle]) -> Transaction {
        let transaction = outside(|| store.transaction("unmount"));
        let mut invalidated = Vec::new();
        let mut disposed = 0;
        for handle in handles {
            for cell in handle.take_caches() {
                cell.dispose(&mut invalidated);
                disposed += 1;
            }
        }
        for cell in invalidated.into_iter().filter(|cell| cell.is_trigger()) {
            transaction.snapshot().push_trigger(cell);
        }
        debug!(transaction = %transaction.id(), disposed, "caches unmounted");
        if let Err(error) = transaction.seal() {
            warn!(transaction = %transaction.id(), error = %error, "unmount failed");
        }
        transaction
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("hint", &self.cell.hint())
            .field("invalid", &self.cell.is_invalid())
            .field("phase", &self.cell.phase())
            .finish()
    }
}
