//! `chamber restart` — Stop a container and boot it again.

use std::process::ExitCode;

use chamber_common::types::ContainerName;
use chamber_runtime::engine::{Engine, StartOutcome};
use clap::Args;

use crate::output;

/// Arguments for the `restart` command.
#[derive(Args, Debug)]
pub struct RestartArgs {
    /// Container name.
    pub name: String,
}

/// Executes the `restart` command.
///
/// # Errors
///
/// Returns an error if the container was never started or fails to boot.
pub fn execute(engine: &Engine, args: &RestartArgs) -> anyhow::Result<ExitCode> {
    let name = ContainerName::new(&args.name)?;
    match engine.restart(&name)? {
        StartOutcome::Background(record) => {
            println!("{} restarted (pid {})", record.name, record.pid);
            Ok(ExitCode::SUCCESS)
        }
        StartOutcome::Exited(code) => Ok(output::exit_code_from_status(code)),
    }
}
