//! Stress command implementation.

use reflux_core::{Config, Store};
use reflux_testkit::{
    stress_cache_invalidation, stress_concurrent_increments, stress_sequential_writes, StressConfig,
    StressTestResult,
};
use serde::Serialize;

/// One stress run with the store statistics it produced.
#[derive(Debug, Serialize)]
struct StressRun {
    name: &'static str,
    result: StressTestResult,
    transactions_committed: u64,
    transactions_canceled: u64,
    conflicts: u64,
    recomputations: u64,
    invalidations: u64,
}

/// Runs the stress command.
pub fn run(operations: usize, threads: usize, handles: usize, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if threads == 0 {
        return Err("At least one thread is required".into());
    }
    let config = StressConfig {
        operations,
        threads,
        handle_count: handles,
        ..Default::default()
    };

    let runs: [(&'static str, fn(&Store, &StressConfig) -> StressTestResult); 3] = [
        ("sequential writes", stress_sequential_writes),
        ("concurrent increments", stress_concurrent_increments),
        ("cache invalidation", stress_cache_invalidation),
    ];

    let mut results = Vec::with_capacity(runs.len());
    for (name, stress) in runs {
        let store = Store::with_config(Config::default());
        let result = stress(&store, &config);
        let stats = store.stats();
        results.push(StressRun {
            name,
            result,
            transactions_committed: stats.transactions_committed,
            transactions_canceled: stats.transactions_canceled,
            conflicts: stats.conflicts,
            recomputations: stats.recomputations,
            invalidations: stats.invalidations,
        });
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        _ => {
            for run in &results {
                run.result.print_summary(run.name);
                println!("Committed: {}", run.transactions_committed);
                println!("Canceled: {}", run.transactions_canceled);
                println!("Recomputations: {}", run.recomputations);
                println!("Invalidations: {}", run.invalidations);
            }
        }
    }

    if results.iter().any(|run| run.result.failed_ops > 0) {
        return Err("Stress run reported failed operations".into());
    }
    Ok(())
}
