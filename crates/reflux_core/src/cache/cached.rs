//! Synchronous cached methods, actions and triggers.

use super::cell::{CacheCell, Renewal};
use super::observer::Observer;
use super::Cache;
use crate::config::{CacheOptions, Isolation, Latency};
use crate::context;
use crate::error::{CoreError, CoreResult};
use crate::state::Handle;
use crate::transaction::{run_as, standalone, Transaction};
use crate::types::{FieldName, Value};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

type Body<A, T> = Arc<dyn Fn(&A) -> CoreResult<T> + Send + Sync>;

/// A synchronous method of a handle, managed by a cache entry.
///
/// Depending on its [`Latency`], calls are memoized until a commit changes
/// something the last computation read (`OnDemand`, `Manually`), re-run
/// automatically after such a commit (`Immediately`, `WhenReady`), or
/// executed every time (`DoesNotCache`, an action).
///
/// # Example
///
/// ```rust,ignore
/// let render = Cached::new(&view, "render", move |_: &()| {
///     let url: String = model.get("url")?;
///     Ok(format!("Url: {url}"))
/// });
///
/// let first = render.get()?;
/// assert!(Arc::ptr_eq(&first, &render.get()?));
/// ```
pub struct Cached<A, T> {
    handle: Handle,
    cell: Arc<CacheCell>,
    body: Body<A, T>,
}

impl<A, T> Clone for Cached<A, T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            cell: Arc::clone(&self.cell),
            body: Arc::clone(&self.body),
        }
    }
}

impl<A, T> Cached<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Creates a memoized method recomputed on demand.
    pub fn new(handle: &Handle, name: FieldName, body: impl Fn(&A) -> CoreResult<T> + Send + Sync + 'static) -> Self {
        Self::with_options(handle, name, CacheOptions::cached(), body)
    }

    /// Creates an action: executed on every call, allowed to modify state.
    pub fn action(handle: &Handle, name: FieldName, body: impl Fn(&A) -> CoreResult<T> + Send + Sync + 'static) -> Self {
        Self::with_options(handle, name, CacheOptions::action(), body)
    }

    /// Creates a trigger: re-run with its last arguments whenever a commit
    /// invalidates it.
    pub fn trigger(handle: &Handle, name: FieldName, body: impl Fn(&A) -> CoreResult<T> + Send + Sync + 'static) -> Self {
        Self::with_options(handle, name, CacheOptions::trigger(), body)
    }

    /// Creates a method with explicit options.
    ///
    /// A method registered on the same handle under the same name shares
    /// the existing cache entry and its options.
    pub fn with_options(
        handle: &Handle,
        name: FieldName,
        options: CacheOptions,
        body: impl Fn(&A) -> CoreResult<T> + Send + Sync + 'static,
    ) -> Self {
        let cell = handle.register_cache(name, || CacheCell::new(handle.store(), handle, name, options));
        let body: Body<A, T> = Arc::new(body);
        let weak = Arc::downgrade(&cell);
        let renew = Arc::clone(&body);
        cell.set_renewal(Renewal::Sync(Arc::new(move || renew_last(&weak, &renew))));
        Self {
            handle: handle.clone(),
            cell,
            body,
        }
    }

    /// Calls the method, reusing the memoized result when it is valid.
    ///
    /// Returns the very same result object while nothing it read changes.
    pub fn call(&self, args: &A) -> CoreResult<Arc<T>> {
        invoke(&self.cell, &self.body, args, false)
    }

    /// Recomputes the method even if the memoized result is valid.
    pub fn refresh(&self, args: &A) -> CoreResult<Arc<T>> {
        invoke(&self.cell, &self.body, args, true)
    }

    /// Returns the last result without computing or recording a dependency.
    pub fn peek(&self) -> Option<CoreResult<Arc<T>>> {
        self.cell.peek().map(|value| downcast(value, &self.cell))
    }

    /// Returns the last result and, if it is invalid, recomputes it in a
    /// standalone transaction for later callers.
    pub fn cached_and_revalidate(&self, args: &A) -> Option<CoreResult<Arc<T>>> {
        let last = self.peek();
        if self.cell.is_invalid() {
            let revalidated = standalone(self.handle.store(), self.cell.hint(), || self.call(args).map(|_| ()));
            if let Err(error) = revalidated {
                warn!(cache = self.cell.hint(), error = %error, "revalidation failed");
            }
        }
        last
    }

    /// Returns the cache entry view.
    #[must_use]
    pub fn cache(&self) -> Cache {
        Cache::new(Arc::clone(&self.cell))
    }

    /// Returns the owning handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl<T> Cached<(), T>
where
    T: Send + Sync + 'static,
{
    /// Calls a method without arguments.
    pub fn get(&self) -> CoreResult<Arc<T>> {
        self.call(&())
    }
}

impl<A, T> fmt::Debug for Cached<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cached").field("cell", &self.cell).finish()
    }
}

fn renew_last<A, T>(cell: &Weak<CacheCell>, body: &Body<A, T>) -> CoreResult<()>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    let Some(cell) = cell.upgrade() else {
        return Ok(());
    };
    let Some(args) = cell.last_args().and_then(|args| args.downcast_ref::<A>().cloned()) else {
        return Ok(());
    };
    invoke(&cell, body, &args, true).map(|_| ())
}

fn invoke<A, T>(cell: &Arc<CacheCell>, body: &Body<A, T>, args: &A, force: bool) -> CoreResult<Arc<T>>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    let frame = context::current();
    let options = cell.options();
    let store = cell.store();
    let active = frame
        .transaction
        .as_ref()
        .filter(|t| t.store().same(store) && !t.is_finished())
        .cloned();
    let snapshot = active.as_ref().map(|t| Arc::clone(t.snapshot()));

    if !force && options.latency != Latency::DoesNotCache {
        let hit = cell.lookup(
            |last| last.and_then(|last| last.downcast_ref::<A>()) == Some(args),
            snapshot.as_deref(),
            options.latency == Latency::Manually,
        );
        if let Some(hit) = hit {
            if let Some(observer) = frame.recording() {
                observer.record_dependency(cell, &hit.dependency);
            }
            store.counters().record_cache_hit();
            trace!(cache = cell.hint(), generation = hit.dependency.generation, "cache hit");
            return downcast(hit.value, cell);
        }
    }

    store.counters().record_recomputation();
    trace!(cache = cell.hint(), latency = ?options.latency, "recomputing");
    let args_value: Value = Arc::new(args.clone());
    let compute = || body(args).map(|value| Arc::new(value) as Value);
    let separate = options.isolation == Isolation::SeparateTransaction;

    if options.latency == Latency::DoesNotCache {
        let value = within_transaction(cell, active.is_some() && !separate, compute);
        cell.complete_uncached(value.clone(), Some(args_value));
        return downcast(value, cell);
    }

    if options.latency.is_trigger() {
        // Stored before the transaction seals: the result is published by
        // the commit that carries the trigger's writes.
        return within_transaction(cell, active.is_some() && !separate, || {
            let transaction =
                Transaction::current().ok_or_else(|| CoreError::fatal("trigger is running outside of a transaction"))?;
            let observer = Observer::new(
                cell.owner(),
                cell.hint().to_string(),
                false,
                Some(Arc::clone(transaction.snapshot())),
            );
            let value = observe(Arc::clone(&observer), compute);
            let completion = cell.complete(value.clone(), Some(args_value), &observer);
            if let Some(outer) = frame.recording() {
                outer.record_dependency(cell, &completion);
            }
            downcast(value, cell)
        });
    }

    let observer = Observer::new(cell.owner(), cell.hint().to_string(), true, snapshot);
    let value = observe(Arc::clone(&observer), compute);
    let completion = cell.complete(value.clone(), Some(args_value), &observer);
    if let Some(outer) = frame.recording() {
        outer.record_dependency(cell, &completion);
    }
    downcast(value, cell)
}

/// Runs `f` in the current transaction when `join` is set, otherwise in a
/// new root transaction.
fn within_transaction<R>(cell: &CacheCell, join: bool, f: impl FnOnce() -> CoreResult<R>) -> CoreResult<R> {
    if join {
        f()
    } else {
        run_as(cell.store(), cell.hint(), true, f)
    }
}

/// Runs `f` with `observer` recording its reads.
pub(super) fn observe<R>(observer: Arc<Observer>, f: impl FnOnce() -> R) -> R {
    context::with(
        |frame| {
            frame.observer = Some(observer);
            frame.nonreactive = false;
        },
        f,
    )
}

pub(super) fn downcast<T: Send + Sync + 'static>(value: CoreResult<Value>, cell: &CacheCell) -> CoreResult<Arc<T>> {
    value?.downcast::<T>().map_err(|_| {
        CoreError::fatal(format!(
            "result of {} is not of type {}",
            cell.hint(),
            std::any::type_name::<T>()
        ))
    })
}
