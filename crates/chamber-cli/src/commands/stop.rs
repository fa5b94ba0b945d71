//! `chamber stop` — Stop containers and clean up resources.

use std::process::ExitCode;

use chamber_runtime::engine::Engine;
use chamber_runtime::lifecycle::StopReport;
use chamber_runtime::process::StopOutcome;
use clap::Args;

use crate::output;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container names, comma-separated.
    pub names: String,
}

fn describe(report: StopReport) -> &'static str {
    match report {
        StopReport::NotRunning => "not running",
        StopReport::Stale => "was not running, stale record removed",
        StopReport::Stopped(StopOutcome::Graceful) => "stopped",
        StopReport::Stopped(StopOutcome::Terminated) => "stopped (SIGTERM)",
        StopReport::Stopped(StopOutcome::Killed) => "stopped (SIGKILL)",
        StopReport::Stopped(StopOutcome::Lingering) => "killed, but the process is still present",
    }
}

/// Executes the `stop` command.
///
/// Every name is attempted; the exit code is that of the first failure.
///
/// # Errors
///
/// Never fails as a whole; per-name failures are reported and reflected in
/// the exit code.
pub fn execute(engine: &Engine, args: &StopArgs) -> anyhow::Result<ExitCode> {
    let mut code = ExitCode::SUCCESS;
    let mut failed = false;
    for (name, result) in engine.stop_many(&args.names) {
        match result {
            Ok(report) => println!("{name}: {}", describe(report)),
            Err(e) => {
                tracing::error!(name = %name, error = %e, "stop failed");
                if !failed {
                    failed = true;
                    code = output::exit_code_for(&anyhow::Error::new(e));
                }
            }
        }
    }
    Ok(code)
}
