//! Store configuration and per-cache options.

use crate::monitor::Monitor;

/// Configuration for a [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum length of a chain of trigger reactions.
    ///
    /// A reaction that would exceed this depth is dropped with a warning.
    pub max_reaction_depth: usize,

    /// Whether committed record chains are trimmed to what open snapshots can see.
    pub trim_history: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_reaction_depth: 64,
            trim_history: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum reaction depth.
    #[must_use]
    pub const fn max_reaction_depth(mut self, depth: usize) -> Self {
        self.max_reaction_depth = depth;
        self
    }

    /// Sets whether history is trimmed on commit.
    #[must_use]
    pub const fn trim_history(mut self, value: bool) -> Self {
        self.trim_history = value;
        self
    }
}

/// How the fields of a handle are managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Fields are plain storage: unversioned, writable anywhere, never observed.
    Stateless,
    /// Fields are versioned and writable inside transactions.
    #[default]
    Stateful,
    /// Fields are versioned and writable only by the handle's own cached methods.
    InternalStateful,
}

/// When a cache entry is recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Latency {
    /// Re-run inside the reaction of the invalidating commit.
    Immediately,
    /// Re-run after the invalidating commit, completing asynchronously.
    WhenReady,
    /// Recompute when read while invalid.
    #[default]
    OnDemand,
    /// Recompute only on explicit request.
    Manually,
    /// Never memoize: every call executes (transactions/actions).
    DoesNotCache,
}

impl Latency {
    /// Returns true for entries that re-run themselves when invalidated.
    pub fn is_trigger(self) -> bool {
        matches!(self, Self::Immediately | Self::WhenReady)
    }

    /// Returns true for pure computations that may not modify state.
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::OnDemand | Self::Manually)
    }
}

/// Which transaction a call executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Join the current transaction for synchronous calls, spawn one per
    /// asynchronous call.
    #[default]
    Default,
    /// Join the current transaction even for asynchronous calls.
    ProlongedTransaction,
    /// Always spawn a separate transaction.
    SeparateTransaction,
}

/// What happens when an asynchronous cache entry is invoked while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reentrance {
    /// Fail the new call with a reentrance error.
    #[default]
    PreventWithError,
    /// Start an independent concurrent run.
    RunSideBySide,
    /// Cancel the running call and start the new one.
    CancelPrevious,
    /// Queue the new call until the running one finishes.
    WaitAndRestart,
}

/// Options of one cache entry.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// When the entry is recomputed.
    pub latency: Latency,
    /// Which transaction a call executes in.
    pub isolation: Isolation,
    /// Policy for overlapping asynchronous calls.
    pub reentrance: Reentrance,
    /// Monitor that tracks asynchronous runs of the entry.
    pub monitor: Option<Monitor>,
}

impl CacheOptions {
    /// Options of a memoized computation.
    #[must_use]
    pub fn cached() -> Self {
        Self::default()
    }

    /// Options of an action: never memoized, may modify state.
    #[must_use]
    pub fn action() -> Self {
        Self {
            latency: Latency::DoesNotCache,
            ..Self::default()
        }
    }

    /// Options of a trigger: re-runs itself after invalidation.
    #[must_use]
    pub fn trigger() -> Self {
        Self {
            latency: Latency::Immediately,
            ..Self::default()
        }
    }

    /// Sets the latency.
    #[must_use]
    pub fn latency(mut self, latency: Latency) -> Self {
        self.latency = latency;
        self
    }

    /// Sets the isolation.
    #[must_use]
    pub fn isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Sets the reentrance policy.
    #[must_use]
    pub fn reentrance(mut self, reentrance: Reentrance) -> Self {
        self.reentrance = reentrance;
        self
    }

    /// Sets the monitor.
    #[must_use]
    pub fn monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = Some(monitor);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.max_reaction_depth, 64);
        assert!(config.trim_history);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new().max_reaction_depth(3).trim_history(false);
        assert_eq!(config.max_reaction_depth, 3);
        assert!(!config.trim_history);
    }

    #[test]
    fn presets() {
        assert_eq!(CacheOptions::cached().latency, Latency::OnDemand);
        assert_eq!(CacheOptions::action().latency, Latency::DoesNotCache);
        assert!(CacheOptions::trigger().latency.is_trigger());
        assert!(Latency::Manually.is_read_only());
        assert!(!Latency::DoesNotCache.is_read_only());

        let options = CacheOptions::action().reentrance(Reentrance::CancelPrevious);
        assert_eq!(options.reentrance, Reentrance::CancelPrevious);
        assert_eq!(options.isolation, Isolation::Default);
    }
}
