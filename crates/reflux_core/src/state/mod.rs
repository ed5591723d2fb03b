//! Versioned object store.
//!
//! Every stateful object is a [`Handle`] pointing at the head of a chain of
//! immutable [`Record`]s. A commit never mutates a record: it installs a new
//! head whose `prev` is the record the transaction started from.

mod handle;
mod record;

pub use handle::Handle;
pub(crate) use record::PendingRecord;
pub use record::Record;
