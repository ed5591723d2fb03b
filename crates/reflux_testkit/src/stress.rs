//! Stress tests for reflux.
//!
//! These tests verify behavior under heavy load and concurrent access:
//! conflicting writers retrying until they commit, and caches recomputed
//! under a stream of invalidating commits.

use reflux_core::{Cached, CoreError, Handle, Store};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone, Serialize)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Commits rejected by conflict and retried.
    pub conflicts: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, conflicts: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            conflicts,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Conflicts: {}", self.conflicts);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Number of distinct handles written.
    pub handle_count: usize,
    /// Attempts per operation before it counts as failed.
    pub max_attempts: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            handle_count: 8,
            max_attempts: 1_000,
        }
    }
}

/// Increments one counter, retrying on conflict.
///
/// Returns the number of conflicts hit, or the error that ended the attempt.
fn increment(store: &Store, counter: &Handle, max_attempts: usize) -> Result<usize, CoreError> {
    let mut conflicts = 0;
    loop {
        match store.run("increment", || counter.update("count", |n: i64| n + 1)) {
            Ok(()) => return Ok(conflicts),
            Err(error) if error.is_conflict() && conflicts + 1 < max_attempts => conflicts += 1,
            Err(error) => return Err(error),
        }
    }
}

fn counters(store: &Store, config: &StressConfig) -> Result<Vec<Handle>, CoreError> {
    let handles = crate::fixtures::handles(store, "Counter", config.handle_count.max(1));
    store.run("counters.init", || {
        for handle in &handles {
            handle.set("count", 0_i64)?;
        }
        Ok(())
    })?;
    Ok(handles)
}

/// Returns the sum of all counters.
pub fn counter_total(handles: &[Handle]) -> i64 {
    handles.iter().filter_map(|h| h.get::<i64>("count").ok()).sum()
}

/// Run a sequential write stress test.
pub fn stress_sequential_writes(store: &Store, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let Ok(handles) = counters(store, config) else {
        return StressTestResult::new(0, config.operations, 0, start.elapsed());
    };

    let mut successful = 0usize;
    let mut failed = 0usize;
    for i in 0..config.operations {
        match increment(store, &handles[i % handles.len()], config.max_attempts) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, 0, start.elapsed())
}

/// Run concurrent conflicting increments.
///
/// Every thread increments counters chosen round-robin; overlapping
/// transactions conflict and are retried, so the final total equals the
/// number of successful operations.
pub fn stress_concurrent_increments(store: &Store, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let Ok(handles) = counters(store, config) else {
        return StressTestResult::new(0, config.operations, 0, start.elapsed());
    };

    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let conflicts = AtomicUsize::new(0);
    let threads = config.threads.max(1);
    let ops_per_thread = config.operations / threads;

    thread::scope(|scope| {
        for t in 0..threads {
            let (handles, successful, failed, conflicts) = (&handles, &successful, &failed, &conflicts);
            scope.spawn(move || {
                for i in 0..ops_per_thread {
                    let counter = &handles[(t + i) % handles.len()];
                    match increment(store, counter, config.max_attempts) {
                        Ok(hit) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                            conflicts.fetch_add(hit, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        conflicts.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run a cache invalidation stress test.
///
/// A cached sum over all counters is read after every commit; an operation
/// fails if the cached value disagrees with the committed state.
pub fn stress_cache_invalidation(store: &Store, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let Ok(handles) = counters(store, config) else {
        return StressTestResult::new(0, config.operations, 0, start.elapsed());
    };
    let summed = handles.clone();
    let total = Cached::new(&handles[0], "total", move |_: &()| {
        summed
            .iter()
            .map(|h| h.get::<i64>("count"))
            .sum::<Result<i64, CoreError>>()
    });

    let mut successful = 0usize;
    let mut failed = 0usize;
    for i in 0..config.operations {
        let written = increment(store, &handles[i % handles.len()], config.max_attempts);
        match (written, total.get()) {
            (Ok(_), Ok(sum)) if *sum == counter_total(&handles) => successful += 1,
            _ => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, 0, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_writes() {
        let store = Store::new();
        let config = StressConfig {
            operations: 500,
            ..Default::default()
        };

        let result = stress_sequential_writes(&store, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 500);
        assert_eq!(result.conflicts, 0);
    }

    #[test]
    fn test_concurrent_increments() {
        let store = Store::new();
        let config = StressConfig {
            operations: 400,
            threads: 4,
            handle_count: 2,
            ..Default::default()
        };

        let result = stress_concurrent_increments(&store, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 400);
        assert_eq!(store.stats().conflicts as usize, result.conflicts);
        assert_eq!(store.stats().transactions_committed, 401);
    }

    #[test]
    fn test_cache_invalidation() {
        let store = Store::new();
        let config = StressConfig {
            operations: 200,
            handle_count: 4,
            ..Default::default()
        };

        let result = stress_cache_invalidation(&store, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(store.stats().recomputations, 200);
    }
}
