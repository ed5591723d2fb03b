//! Transaction-private views of the object graph.
//!
//! A snapshot reads committed records visible at its timestamp and keeps a
//! private [`PendingRecord`] for every handle it writes. At commit the
//! pending records are validated against newer commits ([`Snapshot::rebase`])
//! and installed as the new heads ([`Snapshot::apply`]).

use crate::cache::cell::CacheCell;
use crate::cache::observer::{ReadSet, Source};
use crate::error::{Conflict, CoreError, CoreResult};
use crate::state::{Handle, PendingRecord, Record};
use crate::store::Store;
use crate::types::{FieldName, HandleId, SnapshotId, Timestamp, Value};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Lifecycle state of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// Writes are accepted.
    Open,
    /// Frozen, waiting to be committed or canceled.
    Sealed,
    /// Changes are installed as committed records.
    Committed,
    /// Changes were discarded.
    Canceled,
}

struct Change {
    handle: Handle,
    pending: PendingRecord,
}

#[derive(Default)]
struct Workspace {
    changes: HashMap<HandleId, Change>,
    reads: HashMap<HandleId, HashSet<FieldName>>,
    revision: u64,
    written: HashMap<(HandleId, FieldName), u64>,
}

/// A cache result computed from this snapshot's uncommitted state.
struct PrivateResult {
    cell: Weak<CacheCell>,
    generation: u64,
    reads: ReadSet,
}

/// Values a committed snapshot replaced, used by undo.
pub(crate) struct Revert {
    pub handle: Handle,
    pub base: Arc<Record>,
    pub fields: Vec<FieldName>,
}

/// A transaction's private, copy-on-write view of the object graph.
pub struct Snapshot {
    id: SnapshotId,
    hint: String,
    parent: Option<SnapshotId>,
    store: Store,
    acquired: Timestamp,
    timestamp: AtomicU64,
    archived: AtomicBool,
    state: Mutex<SnapshotState>,
    workspace: Mutex<Workspace>,
    installed: Mutex<HashMap<HandleId, Arc<Record>>>,
    reverts: Mutex<Vec<Revert>>,
    triggers: Mutex<Vec<Arc<CacheCell>>>,
    private: Mutex<Vec<PrivateResult>>,
}

impl Snapshot {
    /// Acquires a new open snapshot from the store clock.
    pub(crate) fn acquire(store: &Store, hint: &str, parent: Option<SnapshotId>) -> Arc<Self> {
        let (id, acquired) = store.acquire();
        Arc::new(Self {
            id,
            hint: hint.to_string(),
            parent,
            store: store.clone(),
            acquired,
            timestamp: AtomicU64::new(acquired.as_u64()),
            archived: AtomicBool::new(false),
            state: Mutex::new(SnapshotState::Open),
            workspace: Mutex::new(Workspace::default()),
            installed: Mutex::new(HashMap::new()),
            reverts: Mutex::new(Vec::new()),
            triggers: Mutex::new(Vec::new()),
            private: Mutex::new(Vec::new()),
        })
    }

    /// Returns the snapshot ID.
    #[must_use]
    pub fn id(&self) -> SnapshotId {
        self.id
    }

    /// Returns the human-readable label.
    #[must_use]
    pub fn hint(&self) -> &str {
        &self.hint
    }

    /// Returns the snapshot this one was acquired from.
    #[must_use]
    pub fn parent(&self) -> Option<SnapshotId> {
        self.parent
    }

    /// Returns the visibility timestamp; after commit, the commit timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.timestamp.load(Ordering::Acquire))
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> SnapshotState {
        *self.state.lock()
    }

    /// Returns true if the snapshot holds uncommitted changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.workspace.lock().changes.is_empty()
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// Reads a field as seen by this snapshot.
    ///
    /// Fails if the record visible at the snapshot's timestamp has been
    /// trimmed from history.
    pub(crate) fn read(&self, handle: &Handle, field: FieldName) -> CoreResult<(Option<Value>, Source)> {
        let open = self.state() == SnapshotState::Open;
        let mut workspace = self.workspace.lock();
        if open {
            workspace.reads.entry(handle.id()).or_default().insert(field);
        }
        if let Some(change) = workspace.changes.get(&handle.id()) {
            return Ok((change.pending.get(field), Source::Pending));
        }
        drop(workspace);
        let record = self.visible(handle)?;
        Ok((record.get(field), Source::Committed(record)))
    }

    /// Returns the committed record of `handle` visible at this snapshot's
    /// timestamp.
    fn visible(&self, handle: &Handle) -> CoreResult<Arc<Record>> {
        let timestamp = self.timestamp();
        handle.head().visible_at(timestamp).ok_or_else(|| {
            CoreError::misuse(format!(
                "history of {} visible to transaction {} ({}) at {} has been trimmed",
                handle, self.id, self.hint, timestamp
            ))
        })
    }

    /// Writes a field into this snapshot's pending record of `handle`.
    pub(crate) fn write(&self, handle: &Handle, field: FieldName, value: Option<Value>) -> CoreResult<()> {
        let state = self.state.lock();
        if *state != SnapshotState::Open {
            return Err(CoreError::misuse(format!(
                "transaction {} ({}) is {:?}, cannot modify {}",
                self.id,
                self.hint,
                *state,
                handle.describe(field)
            )));
        }
        let mut workspace = self.workspace.lock();
        drop(state);
        let change = match workspace.changes.entry(handle.id()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let base = self.visible(handle)?;
                handle.begin_change(self.id);
                entry.insert(Change {
                    handle: handle.clone(),
                    pending: PendingRecord::new(base),
                })
            }
        };
        change.pending.set(field, value);
        workspace.revision += 1;
        let revision = workspace.revision;
        workspace.written.insert((handle.id(), field), revision);
        Ok(())
    }

    /// Returns the number of writes made so far.
    pub(crate) fn revision(&self) -> u64 {
        self.workspace.lock().revision
    }

    /// Returns true if any field of `footprint` was written after `revision`,
    /// or at all when `revision` is `None`.
    pub(crate) fn overwrites(&self, footprint: &HashSet<(HandleId, FieldName)>, revision: Option<u64>) -> bool {
        let workspace = self.workspace.lock();
        if workspace.written.is_empty() {
            return false;
        }
        footprint.iter().any(|key| match workspace.written.get(key) {
            Some(written) => revision.map_or(true, |r| *written > r),
            None => false,
        })
    }

    /// Freezes the snapshot against further writes.
    pub(crate) fn seal(&self) {
        let mut state = self.state.lock();
        if *state == SnapshotState::Open {
            *state = SnapshotState::Sealed;
        }
    }

    /// Validates pending records against commits made since they were based.
    ///
    /// A written handle whose head moved conflicts on the fields that both the
    /// intervening commits changed and this snapshot wrote or read. Handles
    /// without such fields are rebased onto the current head. Must be called
    /// under the store commit lock.
    pub(crate) fn rebase(&self) -> Vec<Conflict> {
        let mut workspace = self.workspace.lock();
        let Workspace { changes, reads, .. } = &mut *workspace;
        let mut conflicts = Vec::new();
        for (id, change) in changes.iter_mut() {
            let head = change.handle.head();
            if Arc::ptr_eq(&head, change.pending.base()) {
                continue;
            }
            let mut touched: HashSet<FieldName> = change.pending.changes().clone();
            if let Some(read) = reads.get(id) {
                touched.extend(read.iter().copied());
            }
            let mut fields: Vec<FieldName> = match head.changed_since(change.pending.base()) {
                Some(changed) => touched.intersection(&changed).copied().collect(),
                None => touched.into_iter().collect(),
            };
            if fields.is_empty() {
                change.pending.rebase_onto(head);
            } else {
                fields.sort_unstable();
                conflicts.push(Conflict {
                    object: *id,
                    hint: change.handle.hint(),
                    fields,
                    snapshot: head.snapshot(),
                });
            }
        }
        conflicts.sort_by_key(|conflict| conflict.object);
        conflicts
    }

    /// Installs pending records as committed heads and invalidates observers.
    ///
    /// Must be called under the store commit lock, after a successful
    /// [`rebase`](Self::rebase). Returns every cache entry invalidated.
    pub(crate) fn apply(&self, timestamp: Timestamp) -> CoreResult<Vec<Arc<CacheCell>>> {
        let state = self.state();
        if state != SnapshotState::Sealed {
            return Err(CoreError::fatal(format!(
                "cannot apply transaction {} ({}) in state {:?}",
                self.id, self.hint, state
            )));
        }
        let changes = std::mem::take(&mut self.workspace.lock().changes);
        for change in changes.values() {
            if !Arc::ptr_eq(&change.handle.head(), change.pending.base()) {
                return Err(CoreError::fatal(format!(
                    "head of {} moved after rebase of transaction {}",
                    change.handle, self.id
                )));
            }
        }

        self.timestamp.store(timestamp.as_u64(), Ordering::Release);
        let mut invalidated = Vec::new();
        let mut installed = HashMap::with_capacity(changes.len());
        let mut reverts = Vec::with_capacity(changes.len());
        for (id, change) in changes {
            let record = Arc::new(change.pending.freeze(self.id, timestamp));
            change.handle.install(Arc::clone(&record));
            change.handle.end_change(self.id);
            change.handle.notify(&record, &mut invalidated);
            let mut fields: Vec<_> = record.changes().iter().copied().collect();
            fields.sort_unstable();
            reverts.push(Revert {
                handle: change.handle,
                base: Arc::clone(change.pending.base()),
                fields,
            });
            installed.insert(id, record);
        }

        if self.store.config().trim_history {
            let oldest = self.store.oldest_active().unwrap_or(timestamp);
            for record in installed.values() {
                record.trim(oldest);
            }
        }
        *self.installed.lock() = installed;
        *self.reverts.lock() = reverts;
        *self.state.lock() = SnapshotState::Committed;

        let private = std::mem::take(&mut *self.private.lock());
        for result in private {
            if let Some(cell) = result.cell.upgrade() {
                cell.publish(result.generation, result.reads, self, &mut invalidated);
            }
        }

        self.triggers
            .lock()
            .extend(invalidated.iter().filter(|cell| cell.is_trigger()).cloned());
        Ok(invalidated)
    }

    /// Drops pending changes and private cache results.
    ///
    /// Returns the cache entries whose private results were dropped.
    pub(crate) fn discard(&self) -> Vec<Arc<CacheCell>> {
        *self.state.lock() = SnapshotState::Canceled;
        let changes = std::mem::take(&mut self.workspace.lock().changes);
        for change in changes.values() {
            change.handle.end_change(self.id);
        }
        let private = std::mem::take(&mut *self.private.lock());
        let mut invalidated = Vec::new();
        for result in private {
            if let Some(cell) = result.cell.upgrade() {
                cell.invalidate(result.generation, &mut invalidated);
            }
        }
        invalidated
    }

    /// Releases the snapshot's hold on history.
    pub(crate) fn archive(&self) {
        if !self.archived.swap(true, Ordering::AcqRel) {
            self.store.release(self.acquired);
        }
    }

    /// Keeps a cache result that saw this snapshot's pending state until commit.
    ///
    /// Hands `reads` back if the snapshot has already committed or been
    /// canceled.
    pub(crate) fn add_private(&self, cell: &Arc<CacheCell>, generation: u64, reads: ReadSet) -> Result<(), ReadSet> {
        let mut private = self.private.lock();
        match self.state() {
            SnapshotState::Open | SnapshotState::Sealed => {
                private.push(PrivateResult {
                    cell: Arc::downgrade(cell),
                    generation,
                    reads,
                });
                Ok(())
            }
            SnapshotState::Committed | SnapshotState::Canceled => Err(reads),
        }
    }

    /// Schedules a trigger to re-run after this snapshot finishes.
    pub(crate) fn push_trigger(&self, cell: Arc<CacheCell>) {
        self.triggers.lock().push(cell);
    }

    pub(crate) fn take_triggers(&self) -> Vec<Arc<CacheCell>> {
        std::mem::take(&mut *self.triggers.lock())
    }

    /// Returns the record this snapshot installed for a handle.
    pub(crate) fn installed(&self, handle: HandleId) -> Option<Arc<Record>> {
        self.installed.lock().get(&handle).cloned()
    }

    pub(crate) fn reverts(&self) -> Vec<(Handle, Arc<Record>, Vec<FieldName>)> {
        self.reverts
            .lock()
            .iter()
            .map(|revert| (revert.handle.clone(), Arc::clone(&revert.base), revert.fields.clone()))
            .collect()
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.archive();
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("hint", &self.hint)
            .field("timestamp", &self.timestamp())
            .field("state", &self.state())
            .finish()
    }
}
