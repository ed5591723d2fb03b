//! # Reflux Core
//!
//! In-process transactional memory with dependency-tracked caches.
//!
//! This crate provides:
//! - Versioned objects ([`Handle`], [`Record`]) read and written through
//!   snapshot-isolated [`Transaction`]s with optimistic conflict detection
//! - Asynchronous transaction bodies, cooperative cancellation and
//!   automatic retry
//! - Memoized methods ([`Cached`], [`AsyncCached`]) invalidated precisely
//!   when the fields they read change
//! - Triggers re-run in a reaction transaction after invalidation
//! - Reentrance policies for overlapping asynchronous calls
//! - A busy/idle [`Monitor`] for asynchronous work
//!
//! ## Usage
//!
//! ```rust,ignore
//! use reflux_core::{Cached, Store};
//!
//! let store = Store::new();
//! let model = store.handle("DemoModel");
//! store.run("init", || model.set("url", "reactronic".to_string()))?;
//!
//! let m = model.clone();
//! let render = Cached::new(&model, "render", move |_: &()| {
//!     Ok(format!("Url: {}", m.get::<String>("url")?))
//! });
//! assert_eq!(*render.get()?, "Url: reactronic");
//!
//! store.run("edit", || model.set("url", "nezaboodka.com".to_string()))?;
//! assert!(render.cache().is_invalid());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod context;
mod error;
mod monitor;
mod snapshot;
mod state;
mod stats;
mod store;
mod transaction;
mod types;

pub use cache::{AsyncCached, Cache, Cached, Invocation, Phase};
pub use config::{CacheOptions, Config, Isolation, Latency, Mode, Reentrance};
pub use error::{Conflict, CoreError, CoreResult};
pub use monitor::{Monitor, Worker};
pub use snapshot::{Snapshot, SnapshotState};
pub use state::{Handle, Record};
pub use stats::{StatsSnapshot, StoreStats};
pub use store::Store;
pub use transaction::{nonreactive, outside, standalone, Bound, Transaction};
pub use types::{BoxFuture, FieldName, HandleId, SnapshotId, Timestamp, Value};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
