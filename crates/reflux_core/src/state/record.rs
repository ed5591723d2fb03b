//! Versions of a handle's fields.

use crate::types::{FieldName, HandleId, SnapshotId, Timestamp, Value};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// One committed version of a handle's fields.
///
/// Records are full copies: every record holds all fields of the handle as
/// they were when its transaction committed, plus the names of the fields
/// that transaction changed. Records are frozen once installed; only the
/// link to the previous record may be cut when history is trimmed.
pub struct Record {
    handle: HandleId,
    snapshot: SnapshotId,
    timestamp: Timestamp,
    data: HashMap<FieldName, Value>,
    changes: HashSet<FieldName>,
    prev: RwLock<Option<Arc<Record>>>,
    blank: bool,
}

impl Record {
    /// Creates the blank record every handle starts from.
    pub(crate) fn blank(handle: HandleId) -> Arc<Self> {
        Arc::new(Self {
            handle,
            snapshot: SnapshotId::new(0),
            timestamp: Timestamp::ZERO,
            data: HashMap::new(),
            changes: HashSet::new(),
            prev: RwLock::new(None),
            blank: true,
        })
    }

    /// Returns the owning handle.
    #[must_use]
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// Returns the transaction that produced this record.
    #[must_use]
    pub fn snapshot(&self) -> SnapshotId {
        self.snapshot
    }

    /// Returns the commit timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns true for the initial, empty record.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.blank
    }

    /// Returns the value of a field.
    pub fn get(&self, field: FieldName) -> Option<Value> {
        self.data.get(field).cloned()
    }

    /// Returns the names of all defined fields.
    pub fn fields(&self) -> Vec<FieldName> {
        let mut fields: Vec<_> = self.data.keys().copied().collect();
        fields.sort_unstable();
        fields
    }

    /// Returns the fields changed relative to the previous record.
    pub fn changes(&self) -> &HashSet<FieldName> {
        &self.changes
    }

    /// Returns the previous record.
    ///
    /// The blank record loops back to itself. Returns `None` when history
    /// below this record was trimmed.
    pub fn prev(self: &Arc<Self>) -> Option<Arc<Record>> {
        if self.blank {
            Some(Arc::clone(self))
        } else {
            self.prev.read().clone()
        }
    }

    fn link(&self) -> Option<Arc<Record>> {
        if self.blank {
            None
        } else {
            self.prev.read().clone()
        }
    }

    /// Returns the newest record in this chain committed at or before `ts`.
    pub(crate) fn visible_at(self: &Arc<Self>, ts: Timestamp) -> Option<Arc<Record>> {
        let mut record = Arc::clone(self);
        while record.timestamp > ts {
            record = record.link()?;
        }
        Some(record)
    }

    /// Returns the union of fields changed by records newer than `base`.
    ///
    /// Returns `None` when `base` is not reachable from this record.
    pub(crate) fn changed_since(self: &Arc<Self>, base: &Arc<Record>) -> Option<HashSet<FieldName>> {
        let mut changed = HashSet::new();
        let mut record = Arc::clone(self);
        loop {
            if Arc::ptr_eq(&record, base) {
                return Some(changed);
            }
            changed.extend(record.changes.iter().copied());
            record = record.link()?;
        }
    }

    /// Like [`changed_since`](Self::changed_since), but ignores records
    /// produced by the snapshot `own`.
    pub(crate) fn changed_by_others_since(
        self: &Arc<Self>,
        base: &Arc<Record>,
        own: SnapshotId,
    ) -> Option<HashSet<FieldName>> {
        let mut changed = HashSet::new();
        let mut record = Arc::clone(self);
        loop {
            if Arc::ptr_eq(&record, base) {
                return Some(changed);
            }
            if record.snapshot != own {
                changed.extend(record.changes.iter().copied());
            }
            record = record.link()?;
        }
    }

    /// Cuts history that no open snapshot can see.
    ///
    /// Keeps every record newer than `oldest` and the one visible at `oldest`.
    pub(crate) fn trim(self: &Arc<Self>, oldest: Timestamp) {
        let mut record = Arc::clone(self);
        while record.timestamp > oldest {
            match record.link() {
                Some(prev) => record = prev,
                None => return,
            }
        }
        if !record.blank {
            record.prev.write().take();
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("handle", &self.handle)
            .field("snapshot", &self.snapshot)
            .field("timestamp", &self.timestamp)
            .field("fields", &self.fields())
            .field("changes", &self.changes)
            .field("blank", &self.blank)
            .finish()
    }
}

/// A record under construction inside an open snapshot.
pub(crate) struct PendingRecord {
    base: Arc<Record>,
    data: HashMap<FieldName, Value>,
    changes: HashSet<FieldName>,
}

impl PendingRecord {
    /// Starts a copy of `base`.
    pub fn new(base: Arc<Record>) -> Self {
        Self {
            data: base.data.clone(),
            changes: HashSet::new(),
            base,
        }
    }

    pub fn base(&self) -> &Arc<Record> {
        &self.base
    }

    pub fn changes(&self) -> &HashSet<FieldName> {
        &self.changes
    }

    pub fn get(&self, field: FieldName) -> Option<Value> {
        self.data.get(field).cloned()
    }

    /// Sets or removes a field.
    pub fn set(&mut self, field: FieldName, value: Option<Value>) {
        match value {
            Some(value) => self.data.insert(field, value),
            None => self.data.remove(field),
        };
        self.changes.insert(field);
    }

    /// Moves the base to `head`, keeping this record's own changes.
    pub fn rebase_onto(&mut self, head: Arc<Record>) {
        let mut data = head.data.clone();
        for field in &self.changes {
            match self.data.get(field) {
                Some(value) => data.insert(field, Arc::clone(value)),
                None => data.remove(field),
            };
        }
        self.data = data;
        self.base = head;
    }

    /// Freezes into a committed record chained onto the base.
    pub fn freeze(&self, snapshot: SnapshotId, timestamp: Timestamp) -> Record {
        Record {
            handle: self.base.handle,
            snapshot,
            timestamp,
            data: self.data.clone(),
            changes: self.changes.clone(),
            prev: RwLock::new(Some(Arc::clone(&self.base))),
            blank: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(n: i32) -> Value {
        Arc::new(n)
    }

    fn commit(base: &Arc<Record>, field: FieldName, n: i32, ts: u64) -> Arc<Record> {
        let mut pending = PendingRecord::new(Arc::clone(base));
        pending.set(field, Some(value(n)));
        Arc::new(pending.freeze(SnapshotId::new(ts), Timestamp::new(ts)))
    }

    fn read(record: &Record, field: FieldName) -> i32 {
        *record.get(field).unwrap().downcast_ref::<i32>().unwrap()
    }

    #[test]
    fn blank_loops_back() {
        let blank = Record::blank(HandleId::new(1));
        assert!(blank.is_blank());
        assert!(Arc::ptr_eq(&blank.prev().unwrap(), &blank));
        assert!(blank.fields().is_empty());
    }

    #[test]
    fn records_are_full_copies() {
        let blank = Record::blank(HandleId::new(1));
        let r1 = commit(&blank, "x", 1, 10);
        let r2 = commit(&r1, "y", 2, 20);

        assert_eq!(r2.fields(), vec!["x", "y"]);
        assert_eq!(read(&r2, "x"), 1);
        assert!(r2.changes().contains("y"));
        assert!(!r2.changes().contains("x"));
    }

    #[test]
    fn visibility_by_timestamp() {
        let blank = Record::blank(HandleId::new(1));
        let r1 = commit(&blank, "x", 1, 10);
        let r2 = commit(&r1, "x", 2, 20);

        assert_eq!(read(&r2.visible_at(Timestamp::new(15)).unwrap(), "x"), 1);
        assert_eq!(read(&r2.visible_at(Timestamp::new(20)).unwrap(), "x"), 2);
        assert!(r2.visible_at(Timestamp::new(5)).unwrap().is_blank());
    }

    #[test]
    fn changed_since_collects_fields() {
        let blank = Record::blank(HandleId::new(1));
        let r1 = commit(&blank, "x", 1, 10);
        let r2 = commit(&r1, "y", 2, 20);
        let r3 = commit(&r2, "z", 3, 30);

        let changed = r3.changed_since(&r1).unwrap();
        assert_eq!(changed.len(), 2);
        assert!(changed.contains("y") && changed.contains("z"));
        assert!(r3.changed_since(&r3).unwrap().is_empty());

        let unrelated = Record::blank(HandleId::new(2));
        assert!(r3.changed_since(&unrelated).is_none());
    }

    #[test]
    fn changes_by_others_skip_own_records() {
        let blank = Record::blank(HandleId::new(1));
        let r1 = commit(&blank, "x", 1, 10);
        let r2 = commit(&r1, "y", 2, 20);
        let r3 = commit(&r2, "z", 3, 30);

        let changed = r3.changed_by_others_since(&r1, SnapshotId::new(30)).unwrap();
        assert_eq!(changed.len(), 1);
        assert!(changed.contains("y"));
    }

    #[test]
    fn rebase_keeps_own_changes() {
        let blank = Record::blank(HandleId::new(1));
        let r1 = commit(&blank, "x", 1, 10);
        let mut pending = PendingRecord::new(Arc::clone(&r1));
        pending.set("y", Some(value(5)));

        let r2 = commit(&r1, "x", 2, 20);
        pending.rebase_onto(Arc::clone(&r2));
        let r3 = Arc::new(pending.freeze(SnapshotId::new(30), Timestamp::new(30)));

        assert_eq!(read(&r3, "x"), 2);
        assert_eq!(read(&r3, "y"), 5);
        assert!(Arc::ptr_eq(&r3.prev().unwrap(), &r2));
    }

    #[test]
    fn trim_keeps_visible_history() {
        let blank = Record::blank(HandleId::new(1));
        let r1 = commit(&blank, "x", 1, 10);
        let r2 = commit(&r1, "x", 2, 20);
        let r3 = commit(&r2, "x", 3, 30);

        r3.trim(Timestamp::new(25));
        assert_eq!(read(&r3.visible_at(Timestamp::new(25)).unwrap(), "x"), 2);
        assert!(r3.visible_at(Timestamp::new(15)).is_none());
        assert!(r2.prev().is_none());
    }
}
