//! Cache entries.
//!
//! A [`CacheCell`] holds the memoized result of one method of one handle,
//! the read-set it was computed from and the bookkeeping of its running
//! asynchronous calls. Every completed computation starts a new
//! *generation*; subscriptions and dependents remember the generation they
//! observed, so invalidating an entry never affects a newer result.

use super::observer::{Observer, ReadSet};
use super::reentrance::RunEntry;
use super::trigger;
use crate::config::{CacheOptions, Latency};
use crate::error::CoreResult;
use crate::snapshot::{Snapshot, SnapshotState};
use crate::state::Handle;
use crate::store::Store;
use crate::types::{BoxFuture, FieldName, HandleId, SnapshotId, Timestamp, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Every handle field a result depends on.
pub(crate) type Footprint = HashSet<(HandleId, FieldName)>;

/// Lifecycle of the runs of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// No run in progress and no unobserved outcome.
    #[default]
    Idle,
    /// At least one run is in progress.
    Running,
    /// The last run completed.
    Finished,
    /// The last run was canceled or superseded.
    Canceled,
}

/// Re-runs an invalidated trigger with its last arguments.
pub(crate) type SyncRenewal = Arc<dyn Fn() -> CoreResult<()> + Send + Sync>;

/// Starts an asynchronous re-run of an invalidated trigger.
pub(crate) type AsyncRenewal = Arc<dyn Fn() -> CoreResult<BoxFuture<CoreResult<()>>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Renewal {
    Sync(SyncRenewal),
    Async(AsyncRenewal),
}

struct CachedResult {
    value: CoreResult<Value>,
    args: Option<Value>,
    /// Snapshot whose uncommitted state the result saw.
    private_to: Option<SnapshotId>,
    footprint: Arc<Footprint>,
    /// Write revision of `private_to` when the result was computed.
    revision: u64,
    /// Newest commit the result reflects.
    latest: Timestamp,
}

/// What a computation inherits from reading a cache entry.
#[derive(Clone)]
pub(crate) struct Dependency {
    pub generation: u64,
    pub footprint: Arc<Footprint>,
    pub private: bool,
    pub latest: Timestamp,
}

/// A memoized result accepted by [`CacheCell::lookup`].
pub(crate) struct Hit {
    pub value: CoreResult<Value>,
    pub dependency: Dependency,
}

#[derive(Default)]
pub(super) struct CellState {
    result: Option<CachedResult>,
    invalid: bool,
    dependents: Vec<(Weak<CacheCell>, u64)>,
    pub(super) phase: Phase,
    pub(super) runs: Vec<RunEntry>,
    disposed: bool,
}

/// One memoized method of one handle.
pub(crate) struct CacheCell {
    owner: HandleId,
    hint: String,
    store: Store,
    options: RwLock<CacheOptions>,
    generation: AtomicU64,
    next_run: AtomicU64,
    pub(super) state: Mutex<CellState>,
    renewal: Mutex<Option<Renewal>>,
}

impl CacheCell {
    pub fn new(store: &Store, handle: &Handle, name: FieldName, options: CacheOptions) -> Arc<Self> {
        Arc::new(Self {
            owner: handle.id(),
            hint: handle.describe(name),
            store: store.clone(),
            options: RwLock::new(options),
            generation: AtomicU64::new(0),
            next_run: AtomicU64::new(1),
            state: Mutex::new(CellState::default()),
            renewal: Mutex::new(None),
        })
    }

    pub fn owner(&self) -> HandleId {
        self.owner
    }

    /// Diagnostic name, e.g. `#23 DemoView.render`.
    pub fn hint(&self) -> &str {
        &self.hint
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn options(&self) -> CacheOptions {
        self.options.read().clone()
    }

    pub fn latency(&self) -> Latency {
        self.options.read().latency
    }

    pub fn configure(&self, f: impl FnOnce(CacheOptions) -> CacheOptions) {
        let mut options = self.options.write();
        *options = f(options.clone());
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn next_run_id(&self) -> u64 {
        self.next_run.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns true for live entries that re-run themselves when invalidated.
    pub fn is_trigger(&self) -> bool {
        self.latency().is_trigger() && !self.state.lock().disposed
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn is_invalid(&self) -> bool {
        let state = self.state.lock();
        state.invalid || state.result.is_none()
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Resets a reported outcome back to idle.
    pub fn observe(&self) -> Phase {
        let mut state = self.state.lock();
        let phase = state.phase;
        if matches!(phase, Phase::Finished | Phase::Canceled) {
            state.phase = Phase::Idle;
        }
        phase
    }

    pub fn set_renewal(&self, renewal: Renewal) {
        *self.renewal.lock() = Some(renewal);
    }

    pub fn renewal(&self) -> Option<Renewal> {
        self.renewal.lock().clone()
    }

    /// Returns the memoized result if it can be reused by a caller in
    /// `snapshot` with arguments accepted by `matches`.
    pub fn lookup(
        &self,
        matches: impl FnOnce(Option<&Value>) -> bool,
        snapshot: Option<&Snapshot>,
        accept_invalid: bool,
    ) -> Option<Hit> {
        let state = self.state.lock();
        if state.disposed {
            return None;
        }
        let result = state.result.as_ref()?;
        if state.invalid && !accept_invalid {
            return None;
        }
        if !matches(result.args.as_ref()) {
            return None;
        }
        let visible = match (result.private_to, snapshot) {
            (None, None) => true,
            (None, Some(snapshot)) => {
                result.latest <= snapshot.timestamp() && !snapshot.overwrites(&result.footprint, None)
            }
            (Some(owner), Some(snapshot)) if owner == snapshot.id() => {
                !snapshot.overwrites(&result.footprint, Some(result.revision))
            }
            (Some(_), _) => false,
        };
        visible.then(|| Hit {
            value: result.value.clone(),
            dependency: Dependency {
                generation: self.generation(),
                footprint: Arc::clone(&result.footprint),
                private: result.private_to.is_some(),
                latest: result.latest,
            },
        })
    }

    /// Returns the last result, valid or not.
    pub fn peek(&self) -> Option<CoreResult<Value>> {
        let state = self.state.lock();
        state.result.as_ref().map(|result| result.value.clone())
    }

    pub fn last_args(&self) -> Option<Value> {
        let state = self.state.lock();
        state.result.as_ref().and_then(|result| result.args.clone())
    }

    /// Stores a computed result together with the reads `observer` recorded.
    ///
    /// Results that saw uncommitted state, or that were produced by a
    /// computation allowed to write, stay private to their snapshot until it
    /// commits. Others are subscribed to their reads immediately, and so are
    /// plain failures, which roll their transaction back.
    pub fn complete(self: &Arc<Self>, value: CoreResult<Value>, args: Option<Value>, observer: &Observer) -> Dependency {
        let mut reads = observer.finish();
        let failed_by_conflict = matches!(&value, Err(error) if error.is_conflict());
        let succeeded = value.is_ok();
        let snapshot = observer.snapshot().cloned();
        let private_to = snapshot
            .as_ref()
            .filter(|_| reads.private || !observer.is_read_only())
            .filter(|_| succeeded || failed_by_conflict)
            .cloned();
        let dependencies = std::mem::take(&mut reads.dependencies);
        let footprint = Arc::new(reads.footprint.clone());
        let revision = snapshot.as_ref().map_or(0, |s| s.revision());
        let latest = reads.latest;
        let mut invalidated = Vec::new();

        let result = CachedResult {
            value,
            args,
            private_to: private_to.as_ref().map(|s| s.id()),
            footprint: Arc::clone(&footprint),
            revision,
            latest,
        };
        let (generation, dependents) = match &private_to {
            Some(snapshot) => {
                let (generation, dependents) = self.store_result(result);
                if let Err(reads) = snapshot.add_private(self, generation, reads) {
                    if snapshot.state() == SnapshotState::Committed {
                        let _commit = self.store.commit_lock();
                        self.publish(generation, reads, snapshot, &mut invalidated);
                    } else {
                        self.invalidate(generation, &mut invalidated);
                        if !failed_by_conflict {
                            invalidated.retain(|cell| !Arc::ptr_eq(cell, self));
                        }
                    }
                }
                (generation, dependents)
            }
            None => {
                let _commit = self.store.commit_lock();
                let (generation, dependents) = self.store_result(result);
                self.publish_public(generation, &reads, &mut invalidated);
                (generation, dependents)
            }
        };

        for (dependency, observed) in dependencies {
            if !dependency.add_dependent(self, generation, observed) {
                self.invalidate(generation, &mut invalidated);
            }
        }
        for (dependent, observed) in dependents {
            if let Some(dependent) = dependent.upgrade() {
                dependent.invalidate(observed, &mut invalidated);
            }
        }
        trace!(cache = %self.hint, generation, private = private_to.is_some(), "cache result stored");
        trigger::schedule(&self.store, invalidated);
        Dependency {
            generation,
            footprint,
            private: private_to.is_some(),
            latest,
        }
    }

    /// Stores the result of a call that is never reused.
    pub fn complete_uncached(&self, value: CoreResult<Value>, args: Option<Value>) {
        let (_, dependents) = self.store_result(CachedResult {
            value,
            args,
            private_to: None,
            footprint: Arc::new(Footprint::new()),
            revision: 0,
            latest: Timestamp::ZERO,
        });
        self.state.lock().invalid = true;
        let mut invalidated = Vec::new();
        for (dependent, observed) in dependents {
            if let Some(dependent) = dependent.upgrade() {
                dependent.invalidate(observed, &mut invalidated);
            }
        }
        trigger::schedule(&self.store, invalidated);
    }

    /// Replaces the result and starts a new generation; returns the old
    /// generation's dependents.
    fn store_result(&self, result: CachedResult) -> (u64, Vec<(Weak<CacheCell>, u64)>) {
        let mut state = self.state.lock();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        state.result = Some(result);
        state.invalid = state.disposed;
        (generation, std::mem::take(&mut state.dependents))
    }

    /// Subscribes a result to committed data. Callers hold the commit lock.
    fn publish_public(self: &Arc<Self>, generation: u64, reads: &ReadSet, invalidated: &mut Vec<Arc<CacheCell>>) {
        let fresh = {
            let mut state = self.state.lock();
            if self.generation() != generation || state.invalid {
                return;
            }
            if let Some(result) = state.result.as_mut() {
                result.private_to = None;
            }
            subscribe(self, generation, reads, None)
        };
        if !fresh {
            self.invalidate(generation, invalidated);
        }
    }

    /// Makes a private result public after its snapshot committed.
    ///
    /// Callers hold the commit lock. The result is invalidated instead if
    /// the snapshot overwrote what it read, or if another commit changed it.
    pub fn publish(
        self: &Arc<Self>,
        generation: u64,
        reads: ReadSet,
        snapshot: &Snapshot,
        invalidated: &mut Vec<Arc<CacheCell>>,
    ) {
        let fresh = {
            let mut state = self.state.lock();
            if self.generation() != generation || state.invalid {
                return;
            }
            let Some(result) = state.result.as_mut() else {
                return;
            };
            let fresh = !snapshot.overwrites(&result.footprint, Some(result.revision))
                && subscribe(self, generation, &reads, Some(snapshot.id()));
            if fresh {
                result.private_to = None;
                if reads.private {
                    result.latest = result.latest.max(snapshot.timestamp());
                }
            }
            fresh
        };
        if !fresh {
            self.invalidate(generation, invalidated);
        }
    }

    /// Registers a cache that read generation `observed` of this entry.
    ///
    /// Returns false if that generation is no longer current.
    pub fn add_dependent(&self, dependent: &Arc<CacheCell>, generation: u64, observed: u64) -> bool {
        let accepts_invalid = self.latency() == Latency::Manually;
        let mut state = self.state.lock();
        if self.generation() != observed || state.disposed || (state.invalid && !accepts_invalid) {
            return false;
        }
        state.dependents.push((Arc::downgrade(dependent), generation));
        true
    }

    /// Marks generation `generation` invalid and cascades to its dependents.
    pub fn invalidate(self: &Arc<Self>, generation: u64, invalidated: &mut Vec<Arc<CacheCell>>) {
        let dependents = {
            let mut state = self.state.lock();
            if self.generation() != generation || state.invalid {
                return;
            }
            state.invalid = true;
            std::mem::take(&mut state.dependents)
        };
        trace!(cache = %self.hint, generation, "cache invalidated");
        self.store.counters().record_invalidations(1);
        invalidated.push(Arc::clone(self));
        for (dependent, observed) in dependents {
            if let Some(dependent) = dependent.upgrade() {
                dependent.invalidate(observed, invalidated);
            }
        }
    }

    /// Drops the result and stops the entry from re-running.
    pub fn dispose(self: &Arc<Self>, invalidated: &mut Vec<Arc<CacheCell>>) {
        let dependents = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.invalid = true;
            state.result = None;
            self.generation.fetch_add(1, Ordering::AcqRel);
            std::mem::take(&mut state.dependents)
        };
        self.renewal.lock().take();
        for (dependent, observed) in dependents {
            if let Some(dependent) = dependent.upgrade() {
                dependent.invalidate(observed, invalidated);
            }
        }
        trace!(cache = %self.hint, "cache disposed");
    }
}

/// Subscribes `cell` to every field in `reads`.
///
/// Returns false without subscribing if a commit other than `own` changed a
/// field after the computation read it.
fn subscribe(cell: &Arc<CacheCell>, generation: u64, reads: &ReadSet, own: Option<SnapshotId>) -> bool {
    for observation in reads.reads.values() {
        let Some(read) = &observation.record else {
            continue;
        };
        if observation.committed.is_empty() {
            continue;
        }
        let head = observation.handle.head();
        let changed = match own {
            Some(own) => head.changed_by_others_since(read, own),
            None => head.changed_since(read),
        };
        match changed {
            Some(changed) if observation.committed.is_disjoint(&changed) => {}
            _ => return false,
        }
    }
    for observation in reads.reads.values() {
        for field in observation.committed.union(&observation.pending) {
            observation.handle.subscribe(field, cell, generation);
        }
    }
    true
}

impl fmt::Debug for CacheCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheCell")
            .field("hint", &self.hint)
            .field("generation", &self.generation())
            .field("invalid", &state.invalid)
            .field("phase", &state.phase)
            .field("runs", &state.runs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cached, Store};

    fn mirror(store: &Store) -> (Handle, Cached<(), i32>) {
        let model = store.handle("Model");
        store.run("init", || model.set("x", 1_i32)).unwrap();
        let source = model.clone();
        let x = Cached::new(&model, "x", move |_: &()| source.get::<i32>("x"));
        (model, x)
    }

    #[test]
    fn newer_public_result_is_hidden_from_older_snapshot() {
        let store = Store::new();
        let (model, x) = mirror(&store);
        let cell = Arc::clone(&x.cache().cell);

        let reader = store.transaction("reader");
        store.run("edit", || model.set("x", 2_i32)).unwrap();
        assert_eq!(*x.get().unwrap(), 2);
        assert!(cell.lookup(|_| true, Some(&**reader.snapshot()), false).is_none());
        assert!(cell.lookup(|_| true, None, false).is_some());

        assert_eq!(reader.run(|| x.get().map(|v| *v)).unwrap(), 1);
        assert_eq!(*x.get().unwrap(), 2);
    }

    #[test]
    fn private_result_becomes_public_on_commit() {
        let store = Store::new();
        let (model, x) = mirror(&store);
        let cell = Arc::clone(&x.cache().cell);

        let edit = store.transaction("edit");
        edit.run(|| {
            model.set("x", 5_i32)?;
            x.get().map(|_| ())
        })
        .unwrap();
        assert!(cell.lookup(|_| true, None, false).is_none());
        assert!(cell.lookup(|_| true, Some(&**edit.snapshot()), false).is_some());

        edit.commit().unwrap();
        let hit = cell.lookup(|_| true, None, false).unwrap();
        assert!(!hit.dependency.private);
        assert!(hit.dependency.latest >= edit.snapshot().timestamp());
        let later = store.transaction("later");
        assert!(cell.lookup(|_| true, Some(&**later.snapshot()), false).is_some());
    }

    #[test]
    fn stale_generation_is_not_invalidated() {
        let store = Store::new();
        let (model, x) = mirror(&store);
        let cell = Arc::clone(&x.cache().cell);
        x.get().unwrap();
        let old = cell.generation();

        store.run("edit", || model.set("x", 2_i32)).unwrap();
        x.get().unwrap();
        assert!(cell.generation() > old);

        let mut invalidated = Vec::new();
        cell.invalidate(old, &mut invalidated);
        assert!(invalidated.is_empty());
        assert!(!cell.is_invalid());
    }

    #[test]
    fn invalidation_cascades_to_current_dependents() {
        let store = Store::new();
        let (model, x) = mirror(&store);
        let dependency = Arc::clone(&x.cache().cell);
        let dependent = CacheCell::new(&store, &model, "label", CacheOptions::cached());
        x.get().unwrap();
        let observed = dependency.generation();

        assert!(!dependency.add_dependent(&dependent, dependent.generation(), observed + 1));
        assert!(dependency.add_dependent(&dependent, dependent.generation(), observed));

        let mut invalidated = Vec::new();
        dependency.invalidate(observed, &mut invalidated);
        assert_eq!(invalidated.len(), 2);
        assert!(dependent.is_invalid());
    }

    #[test]
    fn disposed_entry_is_never_reused() {
        let store = Store::new();
        let (_, x) = mirror(&store);
        let cell = Arc::clone(&x.cache().cell);
        x.get().unwrap();

        cell.dispose(&mut Vec::new());
        assert!(cell.is_disposed());
        assert!(cell.lookup(|_| true, None, true).is_none());
        assert!(cell.peek().is_none());
    }
}
