//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up test stores and the demo
//! scenario used across the integration tests and the CLI: a model loading
//! URLs with delays, a view rendering it, and a trigger printing the view.

use parking_lot::Mutex;
use reflux_core::{
    AsyncCached, CacheOptions, Cached, Config, CoreResult, Handle, Invocation, Monitor, Reentrance,
    Store,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// A test store with a small reaction depth.
pub struct TestStore {
    /// The store instance.
    pub store: Store,
}

impl TestStore {
    /// Creates a store with default configuration.
    pub fn new() -> Self {
        Self { store: Store::new() }
    }

    /// Creates a store with the given configuration.
    pub fn with_config(config: Config) -> Self {
        Self {
            store: Store::with_config(config),
        }
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test with a fresh store.
///
/// # Example
///
/// ```rust,ignore
/// use reflux_testkit::with_store;
///
/// #[test]
/// fn my_test() {
///     with_store(|store| {
///         let model = store.handle("Model");
///         store.run("init", || model.set("x", 1_i64)).unwrap();
///     });
/// }
/// ```
pub fn with_store<F, R>(f: F) -> R
where
    F: FnOnce(&Store) -> R,
{
    let test_store = TestStore::new();
    f(&test_store.store)
}

/// Creates `count` handles named `<prefix>0`, `<prefix>1`, ...
pub fn handles(store: &Store, prefix: &str, count: usize) -> Vec<Handle> {
    (0..count).map(|i| store.handle(&format!("{prefix}{i}"))).collect()
}

/// The calls issued by the reentrance scenario: URL and delay in milliseconds.
pub const DEMO_CALLS: [(&str, u64); 3] = [("google.com", 300), ("microsoft.com", 200), ("nezaboodka.com", 500)];

/// The model of the demo scenario.
///
/// Holds the current `url` and a `log` of completed loads. `load` is an
/// asynchronous action that sets the URL, waits, then appends
/// `<url>/<delay>` to the log. Running loads keep the model's monitor busy.
#[derive(Clone)]
pub struct DemoModel {
    handle: Handle,
    load: AsyncCached<(String, u64), ()>,
    monitor: Monitor,
}

impl DemoModel {
    /// Creates the model with URL `reactronic` and log `[RTA]`.
    pub fn new(store: &Store, policy: Reentrance) -> CoreResult<Self> {
        let handle = store.handle("DemoModel");
        store.run("DemoModel.init", || {
            handle.set("url", "reactronic".to_string())?;
            handle.set("log", vec!["RTA".to_string()])
        })?;

        let monitor = Monitor::new(store, "DemoModel.loading");
        let model = handle.clone();
        let load = AsyncCached::with_options(
            &handle,
            "load",
            CacheOptions::action().reentrance(policy).monitor(monitor.clone()),
            move |(url, delay): (String, u64)| {
                let model = model.clone();
                async move {
                    model.set("url", url.clone())?;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    model.update("log", |mut log: Vec<String>| {
                        log.push(format!("{url}/{delay}"));
                        log
                    })
                }
            },
        );
        Ok(Self { handle, load, monitor })
    }

    /// Returns the model's handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Returns the committed URL.
    pub fn url(&self) -> CoreResult<String> {
        self.handle.get("url")
    }

    /// Returns the committed log.
    pub fn log(&self) -> CoreResult<Vec<String>> {
        self.handle.get("log")
    }

    /// Starts loading `url`.
    pub fn load(&self, url: &str, delay_ms: u64) -> CoreResult<Invocation<()>> {
        self.load.invoke((url.to_string(), delay_ms))
    }

    /// Returns the `load` action.
    pub fn loader(&self) -> &AsyncCached<(String, u64), ()> {
        &self.load
    }

    /// Returns the monitor tracking running loads.
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }
}

/// The view of the demo scenario.
///
/// `render` is a cached method turning the model into two lines, prefixed
/// with `[...] ` while the model is loading; `print` is a trigger appending
/// the rendered lines to the output whenever they change.
pub struct DemoView {
    handle: Handle,
    render: Cached<(), Vec<String>>,
    print: Cached<(), ()>,
    output: Arc<Mutex<Vec<String>>>,
}

impl DemoView {
    /// Creates the view and prints the initial rendering.
    pub fn new(store: &Store, model: &DemoModel) -> CoreResult<Self> {
        let handle = store.handle("DemoView");
        let (source, loading) = (model.handle().clone(), model.monitor().clone());
        let render = Cached::new(&handle, "render", move |_: &()| {
            let url = source.get::<String>("url")?;
            let log = source.get::<Vec<String>>("log")?;
            let prefix = if loading.is_busy() { "[...] " } else { "" };
            Ok(vec![format!("{prefix}Url: {url}"), format!("{prefix}Log: {}", log.join(", "))])
        });

        let output = Arc::new(Mutex::new(Vec::new()));
        let (lines, sink) = (render.clone(), Arc::clone(&output));
        let print = Cached::trigger(&handle, "print", move |_: &()| {
            let rendered = lines.get()?;
            sink.lock().extend(rendered.iter().cloned());
            Ok(())
        });
        print.get()?;

        Ok(Self {
            handle,
            render,
            print,
            output,
        })
    }

    /// Returns the view's handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Returns the current rendering.
    pub fn render(&self) -> CoreResult<Arc<Vec<String>>> {
        self.render.get()
    }

    /// Returns the `print` trigger.
    pub fn printer(&self) -> &Cached<(), ()> {
        &self.print
    }

    /// Returns every line printed so far.
    pub fn output(&self) -> Vec<String> {
        self.output.lock().clone()
    }
}

/// Outcome of one `load` call of the scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallOutcome {
    /// Requested URL.
    pub url: String,
    /// Requested delay.
    pub delay_ms: u64,
    /// Error message if the call failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallOutcome {
    /// Returns true if the call completed.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of replaying the reentrance scenario under one policy.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    /// Name of the reentrance policy.
    pub policy: String,
    /// Lines printed by the view's trigger.
    pub output: Vec<String>,
    /// Outcome of every call, in call order.
    pub calls: Vec<CallOutcome>,
    /// The model's final URL.
    pub url: String,
    /// The model's final log.
    pub log: Vec<String>,
}

/// Replays the reentrance scenario.
///
/// Issues the [`DEMO_CALLS`] back to back without waiting, then waits for
/// all of them. Must run inside a tokio runtime.
pub async fn run_reentrance_scenario(policy: Reentrance) -> CoreResult<ScenarioReport> {
    let store = Store::new();
    let model = DemoModel::new(&store, policy)?;
    let view = DemoView::new(&store, &model)?;

    let mut pending = Vec::with_capacity(DEMO_CALLS.len());
    for (url, delay) in DEMO_CALLS {
        let started = model.load(url, delay).map(tokio::spawn);
        pending.push((url, delay, started));
    }

    let mut calls = Vec::with_capacity(pending.len());
    for (url, delay, started) in pending {
        let error = match started {
            Ok(task) => match task.await {
                Ok(Ok(_)) => None,
                Ok(Err(error)) => Some(error.to_string()),
                Err(join) => Some(join.to_string()),
            },
            Err(error) => Some(error.to_string()),
        };
        calls.push(CallOutcome {
            url: url.to_string(),
            delay_ms: delay,
            error,
        });
    }

    Ok(ScenarioReport {
        policy: format!("{policy:?}"),
        output: view.output(),
        calls,
        url: model.url()?,
        log: model.log()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_store() {
        with_store(|store| {
            let model = store.handle("Model");
            store.run("init", || model.set("x", 1_i64)).unwrap();
            assert_eq!(model.get::<i64>("x").unwrap(), 1);
        });
    }

    #[test]
    fn test_handles_are_named() {
        let store = TestStore::new();
        let all = handles(&store, "Item", 3);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].hint(), "Item2");
    }

    #[test]
    fn test_view_prints_initial_rendering() {
        let store = Store::new();
        let model = DemoModel::new(&store, Reentrance::PreventWithError).unwrap();
        let view = DemoView::new(&store, &model).unwrap();
        assert_eq!(view.output(), vec!["Url: reactronic", "Log: RTA"]);
        assert_eq!(*view.render().unwrap(), vec!["Url: reactronic", "Log: RTA"]);
    }

    #[test]
    fn test_view_reprints_after_commit() {
        let store = Store::new();
        let model = DemoModel::new(&store, Reentrance::PreventWithError).unwrap();
        let view = DemoView::new(&store, &model).unwrap();

        store.run("edit", || model.handle().set("url", "example.org".to_string())).unwrap();
        assert_eq!(
            view.output(),
            vec!["Url: reactronic", "Log: RTA", "Url: example.org", "Log: RTA"]
        );
    }

    #[test]
    fn test_view_marks_busy_model() {
        let store = Store::new();
        let model = DemoModel::new(&store, Reentrance::PreventWithError).unwrap();
        let view = DemoView::new(&store, &model).unwrap();

        let worker = model.monitor().enter("manual");
        assert_eq!(*view.render().unwrap(), vec!["[...] Url: reactronic", "[...] Log: RTA"]);
        model.monitor().leave(&worker);
        assert_eq!(
            view.output(),
            vec![
                "Url: reactronic",
                "Log: RTA",
                "[...] Url: reactronic",
                "[...] Log: RTA",
                "Url: reactronic",
                "Log: RTA",
            ]
        );
    }
}
