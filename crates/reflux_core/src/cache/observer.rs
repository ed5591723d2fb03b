//! Read-set recording for cache computations.

use super::cell::{CacheCell, Dependency};
use crate::snapshot::Snapshot;
use crate::state::{Handle, Record};
use crate::types::{FieldName, HandleId, Timestamp};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Where a read value came from.
pub(crate) enum Source {
    /// A committed record visible to the reader.
    Committed(Arc<Record>),
    /// The reading snapshot's own uncommitted record.
    Pending,
}

/// Everything one computation read from one handle.
pub(crate) struct Observation {
    pub handle: Handle,
    /// First committed record the computation read from.
    pub record: Option<Arc<Record>>,
    /// Fields read from committed records.
    pub committed: HashSet<FieldName>,
    /// Fields read from the snapshot's own pending record.
    pub pending: HashSet<FieldName>,
}

/// The read-set gathered while one computation runs.
#[derive(Default)]
pub(crate) struct ReadSet {
    pub reads: HashMap<HandleId, Observation>,
    /// Cache entries read, with the generation that was read.
    pub dependencies: Vec<(Arc<CacheCell>, u64)>,
    /// Every handle field the result depends on, dependencies included.
    pub footprint: HashSet<(HandleId, FieldName)>,
    /// The result saw uncommitted state of its snapshot.
    pub private: bool,
    /// Timestamp of the newest committed record read, directly or through
    /// a dependency.
    pub latest: Timestamp,
}

/// Records the reads of one running cache computation.
pub(crate) struct Observer {
    owner: HandleId,
    hint: String,
    read_only: bool,
    snapshot: Option<Arc<Snapshot>>,
    reads: Mutex<ReadSet>,
}

impl Observer {
    pub fn new(owner: HandleId, hint: String, read_only: bool, snapshot: Option<Arc<Snapshot>>) -> Arc<Self> {
        Arc::new(Self {
            owner,
            hint,
            read_only,
            snapshot,
            reads: Mutex::new(ReadSet::default()),
        })
    }

    /// Handle whose cached method is running.
    pub fn owner(&self) -> HandleId {
        self.owner
    }

    pub fn hint(&self) -> &str {
        &self.hint
    }

    /// Pure computations may not write stateful handles.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Snapshot the computation runs in, if any.
    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.snapshot.as_ref()
    }

    pub fn record_read(&self, handle: &Handle, field: FieldName, source: Source) {
        let mut guard = self.reads.lock();
        let set = &mut *guard;
        set.footprint.insert((handle.id(), field));
        let observation = set.reads.entry(handle.id()).or_insert_with(|| Observation {
            handle: handle.clone(),
            record: None,
            committed: HashSet::new(),
            pending: HashSet::new(),
        });
        match source {
            Source::Committed(record) => {
                set.latest = set.latest.max(record.timestamp());
                observation.record.get_or_insert(record);
                observation.committed.insert(field);
            }
            Source::Pending => {
                observation.pending.insert(field);
                set.private = true;
            }
        }
    }

    pub fn record_dependency(&self, cell: &Arc<CacheCell>, dependency: &Dependency) {
        let mut set = self.reads.lock();
        set.dependencies.push((Arc::clone(cell), dependency.generation));
        set.footprint.extend(dependency.footprint.iter().copied());
        set.private |= dependency.private;
        set.latest = set.latest.max(dependency.latest);
    }

    /// Takes the gathered read-set.
    pub fn finish(&self) -> ReadSet {
        std::mem::take(&mut *self.reads.lock())
    }
}
