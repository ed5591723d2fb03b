//! Reflux CLI
//!
//! Command-line tools for exercising the reflux runtime.
//!
//! # Commands
//!
//! - `reentrance` - Replay the async reentrance scenario under a policy
//! - `stress` - Run the conflict/retry and cache invalidation stress harness
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use commands::reentrance::Policy;
use tracing_subscriber::EnvFilter;

/// Reflux command-line tools.
#[derive(Parser)]
#[command(name = "reflux")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay the async reentrance scenario
    Reentrance {
        /// Reentrance policy of the load action
        #[arg(short, long, value_enum, default_value = "all")]
        policy: Policy,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run the stress harness
    Stress {
        /// Number of operations per run
        #[arg(short, long, default_value = "10000")]
        operations: usize,

        /// Number of concurrent threads
        #[arg(short, long, default_value = "4")]
        threads: usize,

        /// Number of counters written
        #[arg(long, default_value = "8")]
        handles: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Reentrance { policy, format } => {
            commands::reentrance::run(policy, &format)?;
        }
        Commands::Stress {
            operations,
            threads,
            handles,
            format,
        } => {
            commands::stress::run(operations, threads, handles, &format)?;
        }
        Commands::Version => {
            println!("Reflux CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Reflux Core v{}", reflux_core::VERSION);
        }
    }

    Ok(())
}
