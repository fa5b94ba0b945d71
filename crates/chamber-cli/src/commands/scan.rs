//! `chamber scan` — Adopt running containers that have no record.

use std::process::ExitCode;

use chamber_runtime::engine::Engine;

/// Executes the `scan` command.
///
/// # Errors
///
/// Returns an error if the record store cannot be read or written.
pub fn execute(engine: &Engine) -> anyhow::Result<ExitCode> {
    let adopted = engine.scan()?;
    if adopted.is_empty() {
        println!("No unrecorded containers found.");
    }
    for record in &adopted {
        println!("registered {} (pid {})", record.name, record.pid);
    }
    Ok(ExitCode::SUCCESS)
}
