//! Integration tests for monitor debounce and worker tracking.

use reflux_core::{AsyncCached, CacheOptions, Monitor, Store};
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn reentry_within_delay_keeps_busy() {
    let store = Store::new();
    let monitor = Monitor::new(&store, "loading").delay_before_idle(Duration::from_millis(100));

    let first = monitor.enter("first");
    monitor.leave(&first);
    assert!(monitor.is_busy());
    assert_eq!(monitor.worker_count(), 0);

    sleep(Duration::from_millis(50)).await;
    let second = monitor.enter("second");
    sleep(Duration::from_millis(100)).await;
    assert!(monitor.is_busy());

    monitor.leave(&second);
    sleep(Duration::from_millis(90)).await;
    assert!(monitor.is_busy());
    sleep(Duration::from_millis(20)).await;
    assert!(!monitor.is_busy());
}

#[tokio::test(start_paused = true)]
async fn idle_without_delay_is_immediate() {
    let store = Store::new();
    let monitor = Monitor::new(&store, "loading");
    let worker = monitor.enter("only");
    monitor.leave(&worker);
    assert!(!monitor.is_busy());
}

#[tokio::test(start_paused = true)]
async fn monitor_spans_overlapping_calls() {
    let store = Store::new();
    let model = store.handle("Model");
    let monitor = Monitor::new(&store, "loading").delay_before_idle(Duration::from_millis(20));
    let target = model.clone();
    let load = AsyncCached::with_options(
        &model,
        "load",
        CacheOptions::action()
            .reentrance(reflux_core::Reentrance::RunSideBySide)
            .monitor(monitor.clone()),
        move |(field, delay): (&'static str, u64)| {
            let target = target.clone();
            async move {
                sleep(Duration::from_millis(delay)).await;
                target.set(field, delay)
            }
        },
    );

    let short = tokio::spawn(load.invoke(("a", 10)).unwrap());
    let long = tokio::spawn(load.invoke(("b", 50)).unwrap());
    assert_eq!(monitor.worker_count(), 2);

    short.await.unwrap().unwrap();
    assert_eq!(monitor.worker_count(), 1);
    assert!(monitor.is_busy());

    long.await.unwrap().unwrap();
    assert!(monitor.is_busy());
    sleep(Duration::from_millis(25)).await;
    assert!(!monitor.is_busy());
    assert!(monitor.reset().is_ok());
}

#[tokio::test(start_paused = true)]
async fn workers_expose_running_transactions() {
    let store = Store::new();
    let model = store.handle("Model");
    let monitor = Monitor::new(&store, "loading");
    let target = model.clone();
    let load = AsyncCached::with_options(
        &model,
        "load",
        CacheOptions::action().monitor(monitor.clone()),
        move |delay: u64| {
            let target = target.clone();
            async move {
                sleep(Duration::from_millis(delay)).await;
                target.set("done", delay)
            }
        },
    );

    let running = tokio::spawn(load.invoke(100).unwrap());
    tokio::task::yield_now().await;
    let workers = monitor.workers();
    assert_eq!(workers.len(), 1);
    let transaction = workers[0].transaction().unwrap();
    assert!(!transaction.is_finished());

    workers[0].cancel("no longer needed");
    assert!(running.await.unwrap().unwrap_err().is_canceled());
    assert!(workers[0].is_canceled());
    assert!(workers[0].is_finished());
    assert_eq!(monitor.worker_count(), 0);
    assert!(model.get::<u64>("done").is_err());
}
