//! CLI command definitions and dispatch.

pub mod enter;
pub mod info;
pub mod restart;
pub mod run;
pub mod scan;
pub mod show;
pub mod start;
pub mod status;
pub mod stop;

use std::path::PathBuf;
use std::process::ExitCode;

use chamber_common::config::RuntimeSettings;
use chamber_common::constants::DATA_DIR_ENV;
use chamber_runtime::engine::Engine;
use clap::{Parser, Subcommand};

/// chamber — daemon-less container runtime for full Linux distributions.
#[derive(Parser, Debug)]
#[command(name = "chamber", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding records, logs and image mount points.
    #[arg(long, global = true, env = DATA_DIR_ENV)]
    pub data_dir: Option<PathBuf>,

    /// Executable run before the root switch to set up networking.
    #[arg(long, global = true, env = "CHAMBER_NETWORK_HOOK")]
    pub network_hook: Option<PathBuf>,
}

impl Cli {
    /// Runtime settings after applying global flags.
    #[must_use]
    pub fn settings(&self) -> RuntimeSettings {
        let mut settings = self
            .data_dir
            .as_ref()
            .map_or_else(RuntimeSettings::default, RuntimeSettings::with_data_dir);
        settings.network_hook.clone_from(&self.network_hook);
        settings
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Boot a container from a rootfs directory or image.
    Start(start::StartArgs),
    /// Stop one or more containers (comma-separated).
    Stop(stop::StopArgs),
    /// Stop a container and start it again with the same configuration.
    Restart(restart::RestartArgs),
    /// Open an interactive shell inside a running container.
    Enter(enter::EnterArgs),
    /// Run a command inside a running container.
    Run(run::RunArgs),
    /// Report whether a container is running.
    Status(status::StatusArgs),
    /// Show details of a running container.
    Info(info::InfoArgs),
    /// List running containers.
    Show(show::ShowArgs),
    /// Register running containers that have no record.
    Scan,
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let engine = Engine::new(cli.settings())?;
    match cli.command {
        Command::Start(args) => start::execute(&engine, args),
        Command::Stop(args) => stop::execute(&engine, &args),
        Command::Restart(args) => restart::execute(&engine, &args),
        Command::Enter(args) => enter::execute(&engine, args),
        Command::Run(args) => run::execute(&engine, args),
        Command::Status(args) => status::execute(&engine, &args),
        Command::Info(args) => info::execute(&engine, &args),
        Command::Show(args) => show::execute(&engine, &args),
        Command::Scan => scan::execute(&engine),
    }
}
