//! PID namespace isolation.
//!
//! The guest's PID 1 has a different PID in the host namespace. The
//! `NSpid` line of `/proc/<pid>/status` lists the PID in every nested
//! namespace, outermost first.

use std::path::Path;

/// Parses the innermost PID from the text of `/proc/<pid>/status`.
///
/// Returns `None` when the kernel does not expose `NSpid` (pre-4.1).
#[must_use]
pub fn innermost_nspid(status: &str) -> Option<i32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("NSpid:"))
        .and_then(|rest| rest.split_whitespace().last())
        .and_then(|pid| pid.parse().ok())
}

/// Whether `pid` is PID 1 of a nested PID namespace.
///
/// A process that is PID 1 of the host namespace has a single `NSpid`
/// field and is not a container init.
#[must_use]
pub fn is_namespace_init(proc_root: &Path, pid: i32) -> bool {
    let Ok(status) = std::fs::read_to_string(proc_root.join(pid.to_string()).join("status")) else {
        return false;
    };
    let nested = status
        .lines()
        .find_map(|line| line.strip_prefix("NSpid:"))
        .is_some_and(|rest| rest.split_whitespace().count() > 1);
    nested && innermost_nspid(&status) == Some(1)
}
