//! `chamber show` — List running containers.

use std::process::ExitCode;

use chamber_runtime::engine::Engine;
use clap::Args;

use crate::output;

/// Arguments for the `show` command.
#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `show` command.
///
/// Stale records are purged while listing.
///
/// # Errors
///
/// Returns an error if the record store cannot be read.
pub fn execute(engine: &Engine, args: &ShowArgs) -> anyhow::Result<ExitCode> {
    let running = engine.show()?;

    if args.json {
        let records: Vec<_> = running.iter().map(|(record, _)| record).collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(ExitCode::SUCCESS);
    }

    if running.is_empty() {
        println!("No containers running.");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<20} {:<8} {:<10} {:<10} {:<30}", "NAME", "PID", "HEALTH", "UPTIME", "ROOTFS");
    for (record, health) in &running {
        println!(
            "{:<20} {:<8} {:<10} {:<10} {:<30}",
            record.name.as_str(),
            record.pid,
            health.to_string(),
            output::uptime_since(record.started_at),
            record.rootfs.display()
        );
    }
    Ok(ExitCode::SUCCESS)
}
