//! Integration tests for transaction helpers: undo, inspection, handle
//! modes, reactions and unmounting.

use reflux_core::{
    nonreactive, standalone, Cache, Cached, Config, CoreError, CoreResult, Mode, Store, Transaction,
};
use reflux_testkit::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn undo_restores_previous_values() {
    with_store(|store| {
        let obj = store.handle("Obj");
        store.run("init", || obj.set("x", 1_i64)).unwrap();

        let edit = store.transaction("edit");
        edit.run(|| {
            obj.set("x", 2_i64)?;
            obj.set("y", 3_i64)
        })
        .unwrap();
        edit.commit().unwrap();
        assert_eq!(obj.get::<i64>("x").unwrap(), 2);

        edit.undo().unwrap();
        assert_eq!(obj.get::<i64>("x").unwrap(), 1);
        assert!(matches!(obj.get::<i64>("y"), Err(CoreError::UnknownField { .. })));
    });
}

#[test]
fn undo_requires_commit() {
    with_store(|store| {
        let open = store.transaction("open");
        assert!(matches!(open.undo(), Err(CoreError::Misuse { .. })));
    });
}

#[test]
fn inspection_reads_pending_state_without_writing() {
    with_store(|store| {
        let obj = store.handle("Obj");
        let tx = store.transaction("edit");
        tx.run(|| obj.set("x", 5_i64)).unwrap();

        assert_eq!(tx.inspect(|| obj.get::<i64>("x")).unwrap(), 5);
        let write = tx.inspect(|| obj.set("x", 6_i64));
        assert!(matches!(write, Err(CoreError::Misuse { .. })));
        let failed: CoreResult<()> = tx.inspect(|| Err(CoreError::failed("look only")));
        assert!(failed.is_err());
        assert!(!tx.is_canceled());

        tx.commit().unwrap();
        assert_eq!(obj.get::<i64>("x").unwrap(), 5);
    });
}

#[test]
fn writes_outside_transactions_follow_mode() {
    with_store(|store| {
        let stateful = store.handle("Stateful");
        assert!(matches!(stateful.set("x", 1_i64), Err(CoreError::Misuse { .. })));

        let plain = store.handle_with_mode("Plain", Mode::Stateless);
        plain.set("x", 1_i64).unwrap();
        assert_eq!(plain.get::<i64>("x").unwrap(), 1);

        let internal = store.handle_with_mode("Internal", Mode::InternalStateful);
        let outside_owner = store.run("poke", || internal.set("x", 1_i64));
        assert!(matches!(outside_owner, Err(CoreError::Misuse { .. })));
    });
}

fn inspect_after_two_commits(store: &Store) -> CoreResult<i64> {
    let obj = store.handle("Obj");
    let first = store.transaction("first");
    first.run(|| obj.set("x", 1_i64))?;
    first.commit()?;
    store.run("second", || obj.set("x", 2_i64))?;
    store.run("third", || obj.set("x", 3_i64))?;
    first.inspect(|| obj.get::<i64>("x"))
}

#[test]
fn inspection_of_trimmed_history_fails() {
    with_store(|store| {
        let seen = inspect_after_two_commits(store);
        assert!(matches!(seen, Err(CoreError::Misuse { .. })));
    });

    let kept = TestStore::with_config(Config::new().trim_history(false));
    assert_eq!(inspect_after_two_commits(&kept).unwrap(), 1);
}

#[test]
fn nonreactive_reads_do_not_invalidate() {
    with_store(|store| {
        let obj = store.handle("Obj");
        store
            .run("init", || {
                obj.set("x", 1_i64)?;
                obj.set("y", 1_i64)
            })
            .unwrap();
        let source = obj.clone();
        let sum = Cached::new(&obj, "sum", move |_: &()| {
            let x = source.get::<i64>("x")?;
            let y = nonreactive(|| source.get::<i64>("y"))?;
            Ok(x + y)
        });
        assert_eq!(*sum.get().unwrap(), 2);

        store.run("edit y", || obj.set("y", 10_i64)).unwrap();
        assert!(!sum.cache().is_invalid());
        store.run("edit x", || obj.set("x", 2_i64)).unwrap();
        assert_eq!(*sum.get().unwrap(), 12);
    });
}

#[test]
fn standalone_escapes_failing_transaction() {
    with_store(|store| {
        let obj = store.handle("Obj");
        let result: CoreResult<()> = store.run("outer", || {
            obj.set("x", 1_i64)?;
            standalone(store, "audit", || obj.set("audited", true))?;
            Err(CoreError::failed("outer fails"))
        });
        assert!(result.is_err());
        assert!(obj.get::<bool>("audited").unwrap());
        assert!(obj.get::<i64>("x").is_err());
    });
}

#[test]
fn reaction_depth_is_bounded() {
    let store = TestStore::with_config(Config::new().max_reaction_depth(3));
    let obj = store.handle("PingPong");
    store
        .run("init", || {
            obj.set("a", 0_i64)?;
            obj.set("b", 0_i64)
        })
        .unwrap();

    let (ping_runs, pong_runs) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let (source, counter) = (obj.clone(), Arc::clone(&ping_runs));
    let ping = Cached::trigger(&obj, "ping", move |_: &()| {
        counter.fetch_add(1, Ordering::SeqCst);
        let a = source.get::<i64>("a")?;
        source.set("b", a + 1)
    });
    ping.get().unwrap();

    // Each trigger invalidates the other; the chain stops at depth 3.
    let (source, counter) = (obj.clone(), Arc::clone(&pong_runs));
    let pong = Cached::trigger(&obj, "pong", move |_: &()| {
        counter.fetch_add(1, Ordering::SeqCst);
        let b = source.get::<i64>("b")?;
        source.set("a", b + 1)
    });
    pong.get().unwrap();

    assert_eq!(ping_runs.load(Ordering::SeqCst), 3);
    assert_eq!(pong_runs.load(Ordering::SeqCst), 2);
    assert_eq!(store.stats().reactions, 3);
    assert!(pong.cache().is_invalid());
}

#[tokio::test]
async fn unmount_stops_triggers() {
    let store = Store::new();
    let obj = store.handle("Obj");
    store.run("init", || obj.set("x", 1_i64)).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let (source, counter) = (obj.clone(), Arc::clone(&runs));
    let watch = Cached::trigger(&obj, "watch", move |_: &()| {
        counter.fetch_add(1, Ordering::SeqCst);
        source.get::<i64>("x")
    });
    watch.get().unwrap();

    store.run("edit", || obj.set("x", 2_i64)).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    Cache::unmount(&store, &[&obj]).when_finished(true).await.unwrap();
    store.run("edit again", || obj.set("x", 3_i64)).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn transaction_display_names_id_and_hint() {
    with_store(|store| {
        let tx = store.transaction("checkout");
        assert_eq!(tx.to_string(), format!("{} (checkout)", tx.id()));
        let nested = tx.run(|| Ok(Transaction::current().map(|t| t.id()))).unwrap();
        assert_eq!(nested, Some(tx.id()));
    });
}

#[test]
fn stress_harness_keeps_counters_consistent() {
    let store = Store::new();
    let config = StressConfig {
        operations: 200,
        threads: 4,
        handle_count: 1,
        ..Default::default()
    };
    let result = stress_concurrent_increments(&store, &config);
    assert_eq!(result.successful_ops, 200);
    assert_eq!(store.stats().retries, 0);
}
