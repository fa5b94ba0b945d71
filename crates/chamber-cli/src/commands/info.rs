//! `chamber info` — Show details of a running container.

use std::process::ExitCode;

use chamber_common::types::ContainerName;
use chamber_runtime::engine::Engine;
use clap::Args;

use crate::output;

/// Arguments for the `info` command.
#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Container name.
    pub name: String,

    /// Print JSON instead of aligned fields.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `info` command.
///
/// # Errors
///
/// Returns an error if the container is not running.
pub fn execute(engine: &Engine, args: &InfoArgs) -> anyhow::Result<ExitCode> {
    let name = ContainerName::new(&args.name)?;
    let info = engine.info(&name)?;
    let record = &info.record;

    if args.json {
        let value = serde_json::json!({
            "record": record,
            "init": info.init.to_string(),
            "health": info.health,
            "log": info.log_path,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut fields = vec![
        ("name", record.name.to_string()),
        ("pid", record.pid.to_string()),
        ("state", record.state.to_string()),
        ("init", info.init.to_string()),
        ("health", info.health.to_string()),
        ("rootfs", record.rootfs.display().to_string()),
        ("uptime", output::uptime_since(record.started_at)),
        ("hw-access", record.hw_access.to_string()),
    ];
    if let Some(mount) = &record.mount_path {
        fields.push(("image mount", mount.display().to_string()));
    }
    if let Some(holder) = record.holder_pid {
        fields.push(("holder", holder.to_string()));
        fields.push(("console log", info.log_path.display().to_string()));
    }
    output::print_fields(&fields);
    Ok(ExitCode::SUCCESS)
}
