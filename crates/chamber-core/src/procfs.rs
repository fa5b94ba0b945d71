//! Minimal `/proc` readers.
//!
//! Every function takes the proc root explicitly so tests can point it at a
//! fabricated tree.

use std::path::{Path, PathBuf};

/// Numeric entries of `proc_root`, unsorted.
#[must_use]
pub fn list_pids(proc_root: &Path) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };
    entries
        .filter_map(std::result::Result::ok)
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<i32>().ok()))
        .filter(|pid| *pid > 0)
        .collect()
}

/// `/proc/<pid>` under `proc_root`.
#[must_use]
pub fn pid_dir(proc_root: &Path, pid: i32) -> PathBuf {
    proc_root.join(pid.to_string())
}

/// Path of `relative` inside the root filesystem of `pid`.
#[must_use]
pub fn path_in_root(proc_root: &Path, pid: i32, relative: &Path) -> PathBuf {
    pid_dir(proc_root, pid).join("root").join(relative)
}

/// Short command name of `pid`.
#[must_use]
pub fn comm(proc_root: &Path, pid: i32) -> Option<String> {
    std::fs::read_to_string(pid_dir(proc_root, pid).join("comm"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Extracts the state letter from the text of `/proc/<pid>/stat`.
///
/// The command name may itself contain spaces and parentheses, so the state
/// is read after the last `)`.
#[must_use]
pub fn parse_stat_state(stat: &str) -> Option<char> {
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().next()?.chars().next()
}

/// Whether `pid` exists and is not a zombie or dead.
#[must_use]
pub fn is_live(proc_root: &Path, pid: i32) -> bool {
    std::fs::read_to_string(pid_dir(proc_root, pid).join("stat"))
        .ok()
        .and_then(|s| parse_stat_state(&s))
        .is_some_and(|state| !matches!(state, 'Z' | 'X' | 'x'))
}
