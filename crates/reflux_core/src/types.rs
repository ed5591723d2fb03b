//! Core type definitions for reflux.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Name of a field on a stateful object.
pub type FieldName = &'static str;

/// A field value or a memoized result.
///
/// Values are shared, never mutated in place: a write replaces the whole value.
pub type Value = Arc<dyn Any + Send + Sync>;

/// A boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Identity of one stateful object.
///
/// Handle IDs are assigned by the owning [`Store`](crate::Store) and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub u64);

impl HandleId {
    /// Creates a new handle ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a snapshot, and of the transaction that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    /// Creates a new snapshot ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Logical timestamp.
///
/// Timestamps are drawn from one counter per store, so acquisition and commit
/// timestamps form a single total order. Higher timestamps are later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The timestamp of the blank record, older than anything else.
    pub const ZERO: Self = Self(0);

    /// Creates a new timestamp.
    #[must_use]
    pub const fn new(ts: u64) -> Self {
        Self(ts)
    }

    /// Returns the raw timestamp value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next timestamp.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_id_ordering() {
        let t1 = SnapshotId::new(101);
        let t2 = SnapshotId::new(102);
        assert!(t1 < t2);
        assert_eq!(format!("{t1}"), "T101");
    }

    #[test]
    fn timestamp_next() {
        let ts = Timestamp::new(5);
        assert_eq!(ts.next().as_u64(), 6);
        assert!(Timestamp::ZERO < ts);
    }

    #[test]
    fn handle_id_display() {
        let h = HandleId::new(23);
        assert_eq!(format!("{h}"), "#23");
    }
}
