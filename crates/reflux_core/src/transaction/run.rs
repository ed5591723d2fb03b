//! Running code in transactions and outside of them.

use super::{merge, Transaction};
use crate::cache::observer::Observer;
use crate::context::{self, Frame};
use crate::error::CoreResult;
use crate::store::Store;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Runs `f` in the current transaction of `store`, or in a new root
/// transaction that is sealed when `f` returns.
pub(crate) fn run_as<T>(
    store: &Store,
    hint: &str,
    separate: bool,
    f: impl FnOnce() -> CoreResult<T>,
) -> CoreResult<T> {
    if !separate {
        let current = Transaction::current().filter(|t| t.store().same(store) && !t.is_finished());
        if let Some(current) = current {
            return current.run(f);
        }
    }
    let transaction = Transaction::new(store, hint);
    let result = transaction.run(f);
    merge(result, Some(transaction.seal()))
}

/// Runs an asynchronous body until it settles without a retry request.
///
/// The first attempt runs in `first` when given, without sealing it; every
/// other attempt runs in a new root transaction at reaction depth `depth`. `prepare` is called with
/// each attempt's transaction and may supply an observer recording its
/// reads. `finish` receives the result of the attempt that is not retried,
/// together with its observer, while that attempt's transaction is still
/// current. Returns the result.
pub(crate) async fn autoretry<T, F, Fut, P, C>(
    store: Store,
    hint: String,
    first: Option<Transaction>,
    depth: usize,
    body: F,
    mut prepare: P,
    finish: C,
) -> CoreResult<T>
where
    T: Send + 'static,
    F: Fn() -> Fut,
    Fut: Future<Output = CoreResult<T>> + Send + 'static,
    P: FnMut(&Transaction) -> Option<Arc<Observer>>,
    C: FnOnce(&CoreResult<T>, Option<&Arc<Observer>>) + Send,
{
    let mut joined = first;
    let mut finish = Some(finish);
    loop {
        let (transaction, root) = match joined.take() {
            Some(transaction) => (transaction, false),
            None => (Transaction::spawn(&store, &hint, depth), true),
        };
        let observer = prepare(&transaction);
        let recorder = observer.clone();
        let result = transaction
            .settle(Box::pin(body()), observer, root, |result| {
                if let Some(finish) = finish.take() {
                    finish(result, recorder.as_ref());
                }
            })
            .await;
        if result.is_err() {
            if let Some(target) = transaction.retry_target() {
                debug!(
                    transaction = %transaction.id(),
                    hint = %hint,
                    after = %target.id(),
                    "transaction will be restarted"
                );
                let _ = target.when_finished(true).await;
                store.counters().record_retry();
                continue;
            }
        }
        return result;
    }
}

/// Runs `f` with no current transaction and no recording computation.
pub fn outside<T>(f: impl FnOnce() -> T) -> T {
    context::with(|frame| *frame = Frame::default(), f)
}

/// Runs `f` without recording its reads into the current cache computation.
pub fn nonreactive<T>(f: impl FnOnce() -> T) -> T {
    context::with(|frame| frame.nonreactive = true, f)
}

/// Runs `f` in a new root transaction, detached from the current one.
pub fn standalone<T>(store: &Store, hint: &str, f: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
    outside(|| store.run(hint, f))
}
