//! `chamber run` — Execute a command inside a running container.

use std::process::ExitCode;

use chamber_common::types::ContainerName;
use chamber_runtime::engine::Engine;
use clap::Args;

use crate::output;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container name.
    pub name: String,

    /// Command to execute, resolved against the guest's PATH.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `run` command and exits with the command's status.
///
/// # Errors
///
/// Returns an error if the container is not running or the command
/// cannot be started.
pub fn execute(engine: &Engine, args: RunArgs) -> anyhow::Result<ExitCode> {
    let name = ContainerName::new(args.name)?;
    let status = engine.run(&name, args.command)?;
    Ok(output::exit_code_from_status(status))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::commands::{Cli, Command};

    #[test]
    fn command_keeps_its_own_flags() {
        let cli = Cli::try_parse_from(["chamber", "run", "deb", "ls", "-la", "/"]).expect("parse");
        let Command::Run(args) = cli.command else {
            unreachable!("parsed a run command");
        };
        assert_eq!(args.name, "deb");
        assert_eq!(args.command, vec!["ls", "-la", "/"]);
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["chamber", "run", "deb"]).is_err());
    }
}
