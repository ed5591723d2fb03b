//! Integration tests for isolation, conflict detection, cache correctness
//! and retry.

use proptest::prelude::*;
use reflux_core::{Cached, CoreError, Store, Transaction};
use reflux_testkit::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn disjoint_transactions_both_commit((first, second) in disjoint_plans_strategy(24)) {
        let store = Store::new();
        let objects = handles(&store, "Object", HANDLE_COUNT);
        let t1 = store.transaction("t1");
        let t2 = store.transaction("t2");
        t1.run(|| apply_plan(&objects, &first)).unwrap();
        t2.run(|| apply_plan(&objects, &second)).unwrap();

        prop_assert!(t2.commit().is_ok());
        prop_assert!(t1.commit().is_ok());
        for ((object, field), value) in expected_state(&[&first, &second]) {
            prop_assert_eq!(objects[object].get::<i64>(FIELDS[field]).unwrap(), value);
        }
    }

    #[test]
    fn sequential_plans_apply_in_order(plans in prop::collection::vec(write_plan_strategy(1, 8), 1..6)) {
        let store = Store::new();
        let objects = handles(&store, "Object", HANDLE_COUNT);
        for plan in &plans {
            store.run("plan", || apply_plan(&objects, plan)).unwrap();
        }
        let all: Vec<&[WriteOp]> = plans.iter().map(Vec::as_slice).collect();
        for ((object, field), value) in expected_state(&all) {
            prop_assert_eq!(objects[object].get::<i64>(FIELDS[field]).unwrap(), value);
        }
    }
}

#[test]
fn same_field_conflict_names_object_and_field() {
    let store = Store::new();
    let obj = store.handle("Obj");
    store.run("init", || obj.set("x", 0_i64)).unwrap();

    let t1 = store.transaction("t1");
    let t2 = store.transaction("t2");
    t1.run(|| obj.set("x", 1_i64)).unwrap();
    t2.run(|| obj.set("x", 2_i64)).unwrap();
    t2.commit().unwrap();

    match t1.commit() {
        Err(CoreError::Conflict { conflicts, .. }) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].object, obj.id());
            assert_eq!(conflicts[0].fields, vec!["x"]);
            assert_eq!(conflicts[0].snapshot, t2.id());
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(t1.is_canceled());
    assert_eq!(obj.get::<i64>("x").unwrap(), 2);
    assert_eq!(store.stats().conflicts, 1);
}

#[test]
fn disjoint_fields_of_one_object_both_commit() {
    let store = Store::new();
    let obj = store.handle("Obj");
    store
        .run("init", || {
            obj.set("x", 0_i64)?;
            obj.set("y", 0_i64)
        })
        .unwrap();

    let t1 = store.transaction("t1");
    let t2 = store.transaction("t2");
    t1.run(|| obj.set("x", 1_i64)).unwrap();
    t2.run(|| obj.set("y", 2_i64)).unwrap();
    t2.commit().unwrap();
    t1.commit().unwrap();

    assert_eq!(obj.get::<i64>("x").unwrap(), 1);
    assert_eq!(obj.get::<i64>("y").unwrap(), 2);
}

#[test]
fn cache_is_invalid_iff_observed_field_changes() {
    let store = Store::new();
    let a = store.handle("A");
    let b = store.handle("B");
    store
        .run("init", || {
            a.set("x", 1_i64)?;
            a.set("y", 1_i64)?;
            b.set("x", 1_i64)
        })
        .unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let (source, counter) = (a.clone(), Arc::clone(&runs));
    let cached = Cached::new(&a, "x_plus_one", move |_: &()| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(source.get::<i64>("x")? + 1)
    });
    let first = cached.get().unwrap();

    store.run("other field", || a.set("y", 5_i64)).unwrap();
    store.run("other object", || b.set("x", 5_i64)).unwrap();
    assert!(!cached.cache().is_invalid());
    assert!(Arc::ptr_eq(&first, &cached.get().unwrap()));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    store.run("observed field", || a.set("x", 2_i64)).unwrap();
    assert!(cached.cache().is_invalid());
    assert_eq!(*cached.get().unwrap(), 3);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn canceled_with_retry_target_reexecutes_once() {
    let store = Store::new();
    let obj = store.handle("Obj");
    store.run("init", || obj.set("x", 1_i64)).unwrap();

    let blocker = store.transaction("blocker");
    blocker.run(|| obj.set("x", 10_i64)).unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let task = {
        let (store, obj, blocker, attempts) = (store.clone(), obj.clone(), blocker.clone(), Arc::clone(&attempts));
        tokio::spawn(async move {
            store
                .run_async("rebase", move || {
                    let (obj, blocker, attempts) = (obj.clone(), blocker.clone(), Arc::clone(&attempts));
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            if let Some(current) = Transaction::current() {
                                current.cancel(CoreError::failed("stale input"), Some(&blocker));
                            }
                            return Ok(());
                        }
                        obj.update("x", |x: i64| x + 1)
                    }
                })
                .await
        })
    };

    tokio::task::yield_now().await;
    blocker.commit().unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(obj.get::<i64>("x").unwrap(), 11);
    assert_eq!(store.stats().retries, 1);
}

#[test]
fn end_to_end_cache_follows_commits() {
    let store = Store::new();
    let obj = store.handle("Obj");
    let source = obj.clone();
    let x = Cached::new(&obj, "x", move |_: &()| source.get::<i64>("x"));

    let a = store.transaction("A");
    a.run(|| obj.set("x", 1_i64)).unwrap();
    a.commit().unwrap();

    let b = store.transaction("B");
    let seen = b.run(|| x.get()).unwrap();
    assert_eq!(*seen, 1);
    b.commit().unwrap();

    let c = store.transaction("C");
    c.run(|| obj.set("x", 2_i64)).unwrap();
    c.commit().unwrap();

    assert!(x.cache().is_invalid());
    assert_eq!(*x.get().unwrap(), 2);
}
