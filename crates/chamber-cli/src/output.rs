//! Formatted output helpers for CLI commands.
//!
//! Provides exit code mapping, uptime formatting and the key/value layout
//! shared by `info` and `status`.

use std::process::ExitCode;

use chamber_common::error::ChamberError;
use chrono::{DateTime, Utc};

/// Maps an error to the process exit code of its [`ChamberError`], or 1.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    ExitCode::from(err.downcast_ref::<ChamberError>().map_or(1, ChamberError::exit_code))
}

/// Turns a guest or helper exit status into a process exit code.
#[must_use]
pub fn exit_code_from_status(status: i32) -> ExitCode {
    ExitCode::from(u8::try_from(status).unwrap_or(1))
}

/// Formats an elapsed time compactly (e.g. "3d 4h", "12m 5s").
#[must_use]
pub fn format_uptime(seconds: i64) -> String {
    const MINUTE: i64 = 60;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;

    let s = seconds.max(0);
    if s >= DAY {
        format!("{}d {}h", s / DAY, (s % DAY) / HOUR)
    } else if s >= HOUR {
        format!("{}h {}m", s / HOUR, (s % HOUR) / MINUTE)
    } else if s >= MINUTE {
        format!("{}m {}s", s / MINUTE, s % MINUTE)
    } else {
        format!("{s}s")
    }
}

/// Uptime of something started at `started_at`.
#[must_use]
pub fn uptime_since(started_at: DateTime<Utc>) -> String {
    format_uptime((Utc::now() - started_at).num_seconds())
}

/// Prints aligned `key: value` lines.
pub fn print_fields(fields: &[(&str, String)]) {
    let width = fields.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in fields {
        println!("{key:<width$}  {value}");
    }
}
