//! `chamber status` — Report whether a container is running.

use std::process::ExitCode;

use chamber_common::error::ChamberError;
use chamber_common::types::ContainerName;
use chamber_runtime::engine::Engine;
use chamber_runtime::lifecycle::ContainerStatus;
use clap::Args;

/// Arguments for the `status` command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Container name.
    pub name: String,
}

/// Executes the `status` command.
///
/// Prints `running` (with health) and exits 0, or prints `absent` and exits
/// with the not-found code.
///
/// # Errors
///
/// Returns an error if the record store cannot be read.
pub fn execute(engine: &Engine, args: &StatusArgs) -> anyhow::Result<ExitCode> {
    let name = ContainerName::new(&args.name)?;
    match engine.status(&name)? {
        ContainerStatus::Running { record, health } => {
            println!("running (pid {}, {health})", record.pid);
            Ok(ExitCode::SUCCESS)
        }
        ContainerStatus::Absent => {
            println!("absent");
            Ok(ExitCode::from(ChamberError::container_not_found(name.as_str()).exit_code()))
        }
    }
}
