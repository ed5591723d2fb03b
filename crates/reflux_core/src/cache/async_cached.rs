//! Asynchronous cached methods, actions and triggers.

use super::cached::downcast;
use super::cell::{CacheCell, Phase, Renewal};
use super::observer::Observer;
use super::reentrance::{self, Admission, RunSlot};
use super::Cache;
use crate::config::{CacheOptions, Isolation, Latency};
use crate::context;
use crate::error::CoreResult;
use crate::monitor::WorkerGuard;
use crate::state::Handle;
use crate::transaction::{autoretry, Transaction};
use crate::types::{BoxFuture, FieldName, Value};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tracing::trace;

type Body<A, T> = Arc<dyn Fn(A) -> BoxFuture<CoreResult<T>> + Send + Sync>;

/// An asynchronous method of a handle, managed by a cache entry.
///
/// Each call that is not served from the cache runs in its own transaction
/// (or in the caller's with [`Isolation::ProlongedTransaction`]), which
/// commits after the returned [`Invocation`] settles. Overlapping calls are
/// governed by the entry's [`Reentrance`](crate::Reentrance) policy.
///
/// # Example
///
/// ```rust,ignore
/// let load = AsyncCached::action(&model, "load", move |(url, delay): (String, u64)| {
///     let model = model.clone();
///     async move {
///         model.set("url", url.clone())?;
///         tokio::time::sleep(Duration::from_millis(delay)).await;
///         model.update("log", |mut log: Vec<String>| {
///             log.push(format!("{url}/{delay}"));
///             log
///         })
///     }
/// });
/// load.invoke(("nezaboodka.com".to_string(), 500))?.await?;
/// ```
pub struct AsyncCached<A, T> {
    handle: Handle,
    cell: Arc<CacheCell>,
    body: Body<A, T>,
}

impl<A, T> Clone for AsyncCached<A, T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            cell: Arc::clone(&self.cell),
            body: Arc::clone(&self.body),
        }
    }
}

impl<A, T> AsyncCached<A, T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Creates a memoized asynchronous method recomputed on demand.
    pub fn new<F, Fut>(handle: &Handle, name: FieldName, body: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        Self::with_options(handle, name, CacheOptions::cached(), body)
    }

    /// Creates an asynchronous action.
    pub fn action<F, Fut>(handle: &Handle, name: FieldName, body: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        Self::with_options(handle, name, CacheOptions::action(), body)
    }

    /// Creates an asynchronous trigger.
    ///
    /// Re-runs started by a reaction are spawned on the current tokio
    /// runtime. When the invalidating commit happens outside any runtime,
    /// each re-run gets a thread driving a single-threaded runtime of its
    /// own, so bodies relying on a particular runtime should commit from
    /// inside it.
    pub fn trigger<F, Fut>(handle: &Handle, name: FieldName, body: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        Self::with_options(handle, name, CacheOptions::trigger(), body)
    }

    /// Creates an asynchronous method with explicit options.
    pub fn with_options<F, Fut>(handle: &Handle, name: FieldName, options: CacheOptions, body: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let cell = handle.register_cache(name, || CacheCell::new(handle.store(), handle, name, options));
        let body: Body<A, T> = Arc::new(move |args: A| -> BoxFuture<CoreResult<T>> { Box::pin(body(args)) });
        let weak = Arc::downgrade(&cell);
        let renew = Arc::clone(&body);
        cell.set_renewal(Renewal::Async(Arc::new(move || renew_last(&weak, &renew))));
        Self {
            handle: handle.clone(),
            cell,
            body,
        }
    }

    /// Calls the method.
    ///
    /// Returns a valid memoized result as a ready invocation. Otherwise the
    /// call is admitted by the reentrance policy, which may fail it
    /// synchronously, and runs when the invocation is polled.
    pub fn invoke(&self, args: A) -> CoreResult<Invocation<T>> {
        invoke(&self.cell, &self.body, args, false)
    }

    /// Returns the last result without computing or recording a dependency.
    pub fn peek(&self) -> Option<CoreResult<Arc<T>>> {
        self.cell.peek().map(|value| downcast(value, &self.cell))
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

impl<A, T> fmt::Debug for AsyncCached<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCached").field("cell", &self.cell).finish()
    }
}

fn renew_last<A, T>(cell: &Weak<CacheCell>, body: &Body<A, T>) -> CoreResult<BoxFuture<CoreResult<()>>>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    let last = cell
        .upgrade()
        .and_then(|cell| cell.last_args().and_then(|args| args.downcast_ref::<A>().cloned()).map(|args| (cell, args)));
    let Some((cell, args)) = last else {
        return Ok(Box::pin(async { Ok(()) }));
    };
    let invocation = invoke(&cell, body, args, true)?;
    Ok(Box::pin(async move { invocation.await.map(|_| ()) }))
}

fn invoke<A, T>(cell: &Arc<CacheCell>, body: &Body<A, T>, args: A, force: bool) -> CoreResult<Invocation<T>>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    let frame = context::current();
    let options = cell.options();
    let store = cell.store().clone();
    let current = frame
        .transaction
        .as_ref()
        .filter(|t| t.store().same(&store) && !t.is_finished())
        .cloned();
    let cacheable = options.latency != Latency::DoesNotCache;

    if cacheable && !force {
        let snapshot = current.as_ref().map(|t| Arc::clone(t.snapshot()));
        let hit = cell.lookup(
            |last| last.and_then(|last| last.downcast_ref::<A>()) == Some(&args),
            snapshot.as_deref(),
            options.latency == Latency::Manually,
        );
        if let Some(hit) = hit {
            if let Some(observer) = frame.recording() {
                observer.record_dependency(cell, &hit.dependency);
            }
            store.counters().record_cache_hit();
            trace!(cache = cell.hint(), generation = hit.dependency.generation, "cache hit");
            let value = downcast(hit.value, cell);
            return Ok(Invocation {
                slot: None,
                future: Box::pin(async move { value }),
            });
        }
    }

    let Admission { slot, wait_for, mut guard } = reentrance::admit(cell)?;
    let worker = options
        .monitor
        .as_ref()
        .map(|monitor| WorkerGuard::enter(monitor, cell.hint(), Some(Arc::clone(&slot))));
    let depth = current.as_ref().map_or(0, |t| t.reaction_depth());
    let joined = current.filter(|_| options.isolation == Isolation::ProlongedTransaction);
    let read_only = options.latency.is_read_only();
    store.counters().record_recomputation();
    trace!(cache = cell.hint(), run = guard.id(), "asynchronous call started");

    let cell = Arc::clone(cell);
    let body = Arc::clone(body);
    let run_slot = Arc::clone(&slot);
    let future = async move {
        let _worker = worker;
        if let Some(mut previous) = wait_for {
            let _ = previous.wait_for(|done| *done).await;
        }
        let owner = cell.owner();
        let hint = cell.hint().to_string();
        let attempt_args = args.clone();
        let finished = Arc::clone(&cell);
        let value = autoretry(
            store,
            hint.clone(),
            joined,
            depth,
            move || {
                let pending = body(attempt_args.clone());
                async move { pending.await.map(|value| Arc::new(value) as Value) }
            },
            |transaction: &Transaction| {
                reentrance::attach(&run_slot, transaction);
                cacheable.then(|| {
                    Observer::new(owner, hint.clone(), read_only, Some(Arc::clone(transaction.snapshot())))
                })
            },
            move |value: &CoreResult<Value>, observer: Option<&Arc<Observer>>| {
                let args_value: Value = Arc::new(args);
                match observer {
                    Some(observer) => {
                        finished.complete(value.clone(), Some(args_value), observer);
                    }
                    None => finished.complete_uncached(value.clone(), Some(args_value)),
                }
            },
        )
        .await;
        let canceled = matches!(&value, Err(error) if error.is_canceled());
        guard.finish(if canceled { Phase::Canceled } else { Phase::Finished });
        drop(guard);
        downcast(value, &cell)
    };
    Ok(Invocation {
        slot: Some(slot),
        future: Box::pin(future),
    })
}

/// A call of an [`AsyncCached`] method.
///
/// Resolves with the result once the call's transaction has finished.
pub struct Invocation<T> {
    slot: Option<Arc<Mutex<RunSlot>>>,
    future: BoxFuture<CoreResult<Arc<T>>>,
}

impl<T> Invocation<T> {
    /// Returns the transaction the call is running in, once it has started.
    ///
    /// Returns `None` for calls served from the cache.
    pub fn transaction(&self) -> Option<Transaction> {
        self.slot.as_ref().and_then(|slot| slot.lock().transaction.clone())
    }
}

impl<T> Future for Invocation<T> {
    type Output = CoreResult<Arc<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for Invocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("transaction", &self.transaction().map(|t| t.id()))
            .finish()
    }
}
