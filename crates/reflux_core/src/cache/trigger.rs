//! Reactions: re-running invalidated triggers.
//!
//! Triggers invalidated by a commit are collected on the committing
//! snapshot. When the transaction finishes, [`react`] spawns one reaction
//! transaction that re-runs all of them, so their effects are validated and
//! committed together. A reaction may invalidate further triggers; the chain
//! is cut at [`Config::max_reaction_depth`](crate::Config::max_reaction_depth).

use super::cell::{CacheCell, Renewal};
use crate::config::Latency;
use crate::error::CoreResult;
use crate::store::Store;
use crate::types::BoxFuture;
use crate::transaction::{outside, Transaction};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Spawns the reaction of a finished transaction, if it invalidated triggers.
pub(crate) fn react(origin: &Transaction) -> Option<Transaction> {
    let mut seen = HashSet::new();
    let cells: Vec<Arc<CacheCell>> = origin
        .snapshot()
        .take_triggers()
        .into_iter()
        .filter(|cell| seen.insert(Arc::as_ptr(cell)) && cell.is_trigger())
        .collect();
    if cells.is_empty() {
        return None;
    }
    let store = origin.store().clone();
    let depth = origin.reaction_depth() + 1;
    if depth > store.config().max_reaction_depth {
        warn!(
            transaction = %origin.id(),
            hint = origin.hint(),
            depth,
            triggers = cells.len(),
            "reaction depth exceeded, triggers are not re-run"
        );
        return None;
    }

    let reaction = outside(|| Transaction::spawn(&store, "reaction", depth));
    store.counters().record_reaction();
    debug!(
        transaction = %reaction.id(),
        origin = %origin.id(),
        depth,
        triggers = cells.len(),
        "reaction started"
    );

    let mut detached = Vec::new();
    for cell in cells {
        let Some(renewal) = cell.renewal() else {
            continue;
        };
        match renewal {
            Renewal::Sync(renew) => {
                let renewed = reaction.run(|| Ok(renew()));
                report(&cell, renewed.and_then(|result| result));
            }
            Renewal::Async(renew) => {
                let started = reaction.run(|| Ok(renew())).and_then(|result| result);
                let future = match started {
                    Ok(future) => future,
                    Err(error) => {
                        report(&cell, Err(error));
                        continue;
                    }
                };
                let hint = cell.hint().to_string();
                let watched = async move {
                    if let Err(error) = future.await {
                        warn!(cache = %hint, error = %error, "trigger failed");
                    }
                };
                // A WhenReady call runs on its own; the reaction does not wait for it.
                if cell.latency() == Latency::WhenReady {
                    detached.push((cell, Box::pin(watched) as BoxFuture<()>));
                    continue;
                }
                match reaction.bind(async move {
                    watched.await;
                    Ok(())
                }) {
                    Ok(bound) => spawn_detached(cell.hint(), async move {
                        let _ = bound.await;
                    }),
                    Err(error) => report(&cell, Err(error)),
                }
            }
        }
    }
    if let Err(error) = reaction.seal() {
        debug!(transaction = %reaction.id(), error = %error, "reaction failed");
    }
    for (cell, future) in detached {
        spawn_detached(cell.hint(), future);
    }
    Some(reaction)
}

/// Makes sure invalidated triggers among `cells` re-run.
///
/// They join the reaction of the current transaction; without one, an
/// empty transaction is committed to carry them. That transaction keeps the
/// reaction depth of the finished transaction still current, if any.
pub(crate) fn schedule(store: &Store, cells: Vec<Arc<CacheCell>>) {
    let triggers: Vec<Arc<CacheCell>> = cells.into_iter().filter(|cell| cell.is_trigger()).collect();
    if triggers.is_empty() {
        return;
    }
    let current = Transaction::current().filter(|t| t.store().same(store));
    if let Some(current) = current.as_ref().filter(|t| !t.is_finished()) {
        for cell in triggers {
            current.snapshot().push_trigger(cell);
        }
        return;
    }
    let depth = current.map_or(0, |t| t.reaction_depth());
    let revalidation = outside(|| Transaction::spawn(store, "revalidation", depth));
    for cell in triggers {
        revalidation.snapshot().push_trigger(cell);
    }
    if let Err(error) = revalidation.seal() {
        warn!(transaction = %revalidation.id(), error = %error, "revalidation failed");
    }
}

/// Runs a future on the current tokio runtime without awaiting it.
///
/// Outside a runtime the future is driven to completion on a dedicated
/// thread with a single-threaded runtime of its own.
pub(crate) fn spawn_detached(hint: &str, future: impl Future<Output = ()> + Send + 'static) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(future);
        return;
    }
    let name = hint.to_string();
    let spawned = std::thread::Builder::new().name("reflux-trigger".into()).spawn(move || {
        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(future),
            Err(error) => warn!(cache = %name, error = %error, "cannot start runtime to re-run trigger"),
        }
    });
    if let Err(error) = spawned {
        warn!(cache = hint, error = %error, "cannot start thread to re-run trigger");
    }
}

fn report(cell: &CacheCell, result: CoreResult<()>) {
    if let Err(error) = result {
        warn!(cache = cell.hint(), error = %error, "trigger failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheOptions, Cached, Config};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn watch(store: &Store, options: CacheOptions) -> (Cached<(), ()>, Arc<AtomicUsize>) {
        let view = store.handle("View");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let watch = Cached::with_options(&view, "watch", options, move |_: &()| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        watch.get().unwrap();
        (watch, runs)
    }

    #[test]
    fn late_revalidation_keeps_origin_depth() {
        let store = Store::with_config(Config::new().max_reaction_depth(2));
        let (watch, runs) = watch(&store, CacheOptions::trigger());
        let cell = Arc::clone(&watch.cache().cell);

        let deep = Transaction::spawn(&store, "reaction", 2);
        deep.commit().unwrap();
        let mut invalidated = Vec::new();
        cell.invalidate(cell.generation(), &mut invalidated);
        deep.inspect(|| {
            schedule(&store, invalidated);
            Ok(())
        })
        .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats().reactions, 0);
        assert!(cell.is_invalid());

        watch.get().unwrap();
        let mut invalidated = Vec::new();
        cell.invalidate(cell.generation(), &mut invalidated);
        schedule(&store, invalidated);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(store.stats().reactions, 1);
    }

    #[test]
    fn when_ready_renewal_commits_in_reaction() {
        let store = Store::new();
        let model = store.handle("Model");
        let view = store.handle("View");
        store.run("init", || model.set("x", 1_i32)).unwrap();
        let (source, target) = (model.clone(), view.clone());
        let mirror = Cached::with_options(
            &view,
            "mirror",
            CacheOptions::trigger().latency(Latency::WhenReady),
            move |_: &()| target.set("x", source.get::<i32>("x")?),
        );
        mirror.get().unwrap();

        let edit = store.transaction("edit");
        edit.run(|| model.set("x", 2_i32)).unwrap();
        edit.commit().unwrap();
        let reaction = edit.reaction().unwrap();
        assert_eq!(view.head().snapshot(), reaction.id());
        assert_eq!(view.get::<i32>("x").unwrap(), 2);
    }

    #[test]
    fn reaction_runs_each_trigger_once() {
        let store = Store::new();
        let (watch, runs) = watch(&store, CacheOptions::trigger());
        let cell = Arc::clone(&watch.cache().cell);

        let twice = store.transaction("twice");
        twice.snapshot().push_trigger(Arc::clone(&cell));
        twice.snapshot().push_trigger(cell);
        twice.commit().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(store.stats().reactions, 1);
    }

    #[test]
    fn disposed_trigger_is_skipped() {
        let store = Store::new();
        let (watch, runs) = watch(&store, CacheOptions::trigger());
        let cell = Arc::clone(&watch.cache().cell);
        cell.dispose(&mut Vec::new());

        let tx = store.transaction("after dispose");
        tx.snapshot().push_trigger(cell);
        tx.commit().unwrap();
        assert!(tx.reaction().is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_future_runs_without_runtime() {
        let (sender, receiver) = std::sync::mpsc::channel();
        spawn_detached("detached", async move {
            sender.send(42).unwrap();
        });
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }
}
