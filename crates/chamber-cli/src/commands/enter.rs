//! `chamber enter` — Open a login shell inside a running container.

use std::process::ExitCode;

use chamber_common::types::ContainerName;
use chamber_runtime::engine::Engine;
use clap::Args;

use crate::output;

/// Arguments for the `enter` command.
#[derive(Args, Debug)]
pub struct EnterArgs {
    /// Container name.
    pub name: String,

    /// Log in as this user instead of root.
    #[arg(short, long)]
    pub user: Option<String>,
}

/// Executes the `enter` command and exits with the shell's status.
///
/// # Errors
///
/// Returns an error if the container is not running or has no shell.
pub fn execute(engine: &Engine, args: EnterArgs) -> anyhow::Result<ExitCode> {
    let name = ContainerName::new(args.name)?;
    let status = engine.enter(&name, args.user)?;
    Ok(output::exit_code_from_status(status))
}
