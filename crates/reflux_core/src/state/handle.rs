//! Identity of one stateful object.

use super::record::Record;
use crate::cache::cell::CacheCell;
use crate::cache::observer::Source;
use crate::config::Mode;
use crate::context;
use crate::error::{CoreError, CoreResult};
use crate::store::Store;
use crate::types::{FieldName, HandleId, SnapshotId, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A cache entry waiting to be told about changes of one field.
struct Subscription {
    cell: Weak<CacheCell>,
    generation: u64,
}

impl Subscription {
    fn is_live(&self) -> bool {
        self.cell
            .upgrade()
            .is_some_and(|cell| cell.generation() == self.generation)
    }
}

struct HandleInner {
    id: HandleId,
    store: Store,
    mode: Mode,
    hint: RwLock<String>,
    head: RwLock<Arc<Record>>,
    changing: Mutex<Option<SnapshotId>>,
    writers: AtomicUsize,
    stateless: RwLock<HashMap<FieldName, Value>>,
    observers: Mutex<HashMap<FieldName, Vec<Subscription>>>,
    caches: Mutex<HashMap<&'static str, Arc<CacheCell>>>,
}

/// A stateful object.
///
/// Cloning a handle is cheap and yields the same object. Fields are read
/// through the current transaction's snapshot and written into it; outside a
/// transaction reads see the latest committed record.
///
/// # Example
///
/// ```rust,ignore
/// let store = Store::new();
/// let model = store.handle("DemoModel");
/// store.run("init", || model.set("url", "reactronic".to_string()))?;
/// assert_eq!(model.get::<String>("url")?, "reactronic");
/// ```
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    pub(crate) fn new(store: &Store, id: HandleId, hint: &str, mode: Mode) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                store: store.clone(),
                mode,
                hint: RwLock::new(hint.to_string()),
                head: RwLock::new(Record::blank(id)),
                changing: Mutex::new(None),
                writers: AtomicUsize::new(0),
                stateless: RwLock::new(HashMap::new()),
                observers: Mutex::new(HashMap::new()),
                caches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the handle ID.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Returns the store the handle belongs to.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Returns how fields of this handle are managed.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// Returns the human-readable label.
    #[must_use]
    pub fn hint(&self) -> String {
        self.inner.hint.read().clone()
    }

    /// Replaces the human-readable label.
    pub fn set_hint(&self, hint: impl Into<String>) {
        *self.inner.hint.write() = hint.into();
    }

    /// Returns the latest committed record.
    #[must_use]
    pub fn head(&self) -> Arc<Record> {
        Arc::clone(&self.inner.head.read())
    }

    /// Returns the number of open transactions holding changes of this handle.
    #[must_use]
    pub fn writers(&self) -> usize {
        self.inner.writers.load(Ordering::Acquire)
    }

    /// Returns the transaction that most recently started changing this handle.
    #[must_use]
    pub fn changing(&self) -> Option<SnapshotId> {
        *self.inner.changing.lock()
    }

    /// Names a field for diagnostics, e.g. `#23 DemoView.test`.
    pub fn describe(&self, field: FieldName) -> String {
        format!("{self}.{field}")
    }

    /// Reads a field and clones it out as `T`.
    pub fn get<T: Clone + 'static>(&self, field: FieldName) -> CoreResult<T> {
        let value = self.get_value(field)?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| CoreError::TypeMismatch {
                object: self.to_string(),
                field,
                expected: std::any::type_name::<T>(),
            })
    }

    /// Reads a field.
    ///
    /// Inside a cache computation the read is recorded, so the cache is
    /// invalidated when a later commit changes the field.
    pub fn get_value(&self, field: FieldName) -> CoreResult<Value> {
        let value = if self.inner.mode == Mode::Stateless {
            self.inner.stateless.read().get(field).cloned()
        } else {
            let frame = context::current();
            let (value, source) = match &frame.transaction {
                Some(transaction) => transaction.snapshot().read(self, field)?,
                None => {
                    let head = self.head();
                    (head.get(field), Source::Committed(head))
                }
            };
            if let Some(observer) = frame.recording() {
                observer.record_read(self, field, source);
            }
            value
        };
        value.ok_or_else(|| CoreError::UnknownField {
            object: self.to_string(),
            field,
        })
    }

    /// Writes a field.
    pub fn set<T: Send + Sync + 'static>(&self, field: FieldName, value: T) -> CoreResult<()> {
        self.set_value(field, Arc::new(value))
    }

    /// Writes a field from a shared value.
    pub fn set_value(&self, field: FieldName, value: Value) -> CoreResult<()> {
        if self.inner.mode == Mode::Stateless {
            self.inner.stateless.write().insert(field, value);
            return Ok(());
        }
        let frame = context::current();
        let Some(transaction) = frame.transaction.as_ref() else {
            return Err(CoreError::misuse(format!(
                "stateful property {} can only be modified inside transaction",
                self.describe(field)
            )));
        };
        if frame.inspection {
            return Err(CoreError::misuse("cannot make changes during inspection"));
        }
        if !transaction.store().same(self.store()) {
            return Err(CoreError::misuse(format!(
                "{} belongs to another store than transaction {}",
                self.describe(field),
                transaction
            )));
        }
        match (&frame.observer, self.inner.mode) {
            (Some(observer), Mode::InternalStateful) if observer.owner() == self.id() => {}
            (_, Mode::InternalStateful) => {
                return Err(CoreError::misuse(format!(
                    "internal property {} can only be modified by methods of its owner",
                    self.describe(field)
                )));
            }
            (Some(observer), _) if observer.is_read_only() => {
                return Err(CoreError::misuse(format!(
                    "cached computation {} cannot modify {}",
                    observer.hint(),
                    self.describe(field)
                )));
            }
            _ => {}
        }
        transaction.snapshot().write(self, field, Some(value))
    }

    /// Reads a field, applies `f`, and writes the result back.
    pub fn update<T, F>(&self, field: FieldName, f: F) -> CoreResult<()>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> T,
    {
        let current = self.get::<T>(field)?;
        self.set(field, f(current))
    }

    pub(crate) fn begin_change(&self, snapshot: SnapshotId) {
        self.inner.writers.fetch_add(1, Ordering::AcqRel);
        *self.inner.changing.lock() = Some(snapshot);
    }

    pub(crate) fn end_change(&self, snapshot: SnapshotId) {
        self.inner.writers.fetch_sub(1, Ordering::AcqRel);
        let mut changing = self.inner.changing.lock();
        if *changing == Some(snapshot) {
            *changing = None;
        }
    }

    pub(crate) fn install(&self, record: Arc<Record>) {
        *self.inner.head.write() = record;
    }

    /// Subscribes a cache entry to changes of `field`.
    pub(crate) fn subscribe(&self, field: FieldName, cell: &Arc<CacheCell>, generation: u64) {
        let mut observers = self.inner.observers.lock();
        let list = observers.entry(field).or_default();
        list.retain(Subscription::is_live);
        list.push(Subscription {
            cell: Arc::downgrade(cell),
            generation,
        });
    }

    /// Invalidates the cache entries observing fields changed by `record`.
    pub(crate) fn notify(&self, record: &Record, invalidated: &mut Vec<Arc<CacheCell>>) {
        let subscriptions: Vec<Subscription> = {
            let mut observers = self.inner.observers.lock();
            record
                .changes()
                .iter()
                .filter_map(|field| observers.remove(field))
                .flatten()
                .collect()
        };
        for subscription in subscriptions {
            if let Some(cell) = subscription.cell.upgrade() {
                cell.invalidate(subscription.generation, invalidated);
            }
        }
    }

    /// Returns the cache entry registered under `name`, creating it if needed.
    pub(crate) fn register_cache(
        &self,
        name: &'static str,
        create: impl FnOnce() -> Arc<CacheCell>,
    ) -> Arc<CacheCell> {
        let mut caches = self.inner.caches.lock();
        Arc::clone(caches.entry(name).or_insert_with(create))
    }

    /// Removes and returns every cache entry of this handle.
    pub(crate) fn take_caches(&self) -> Vec<Arc<CacheCell>> {
        self.inner.caches.lock().drain().map(|(_, cell)| cell).collect()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Handle {}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.inner.id, self.inner.hint.read())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("hint", &*self.inner.hint.read())
            .field("mode", &self.inner.mode)
            .field("writers", &self.writers())
            .finish()
    }
}
