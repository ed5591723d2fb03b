//! Reentrance command implementation.

use clap::ValueEnum;
use reflux_core::Reentrance;
use reflux_testkit::{run_reentrance_scenario, ScenarioReport};
use tracing::info;

/// Reentrance policy selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Policy {
    /// Fail overlapping calls
    Prevent,
    /// Run overlapping calls concurrently
    SideBySide,
    /// Cancel the running call in favor of the new one
    CancelPrevious,
    /// Queue the new call behind the running one
    WaitAndRestart,
    /// Replay every policy
    All,
}

impl Policy {
    fn policies(self) -> Vec<Reentrance> {
        match self {
            Policy::Prevent => vec![Reentrance::PreventWithError],
            Policy::SideBySide => vec![Reentrance::RunSideBySide],
            Policy::CancelPrevious => vec![Reentrance::CancelPrevious],
            Policy::WaitAndRestart => vec![Reentrance::WaitAndRestart],
            Policy::All => vec![
                Reentrance::PreventWithError,
                Reentrance::RunSideBySide,
                Reentrance::CancelPrevious,
                Reentrance::WaitAndRestart,
            ],
        }
    }
}

/// Runs the reentrance command.
pub fn run(policy: Policy, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    let mut reports = Vec::new();
    for policy in policy.policies() {
        info!(policy = ?policy, "replaying scenario");
        reports.push(runtime.block_on(run_reentrance_scenario(policy))?);
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        _ => {
            for report in &reports {
                print_text_output(report);
            }
        }
    }

    Ok(())
}

fn print_text_output(report: &ScenarioReport) {
    println!("=== {} ===", report.policy);
    println!();
    println!("Calls:");
    for call in &report.calls {
        match &call.error {
            None => println!("  load({}, {}ms): ok", call.url, call.delay_ms),
            Some(error) => println!("  load({}, {}ms): {}", call.url, call.delay_ms, error),
        }
    }
    println!();
    println!("Output:");
    for line in &report.output {
        println!("  {}", line);
    }
    println!();
    println!("Final url: {}", report.url);
    println!("Final log: {}", report.log.join(", "));
    println!();
}
