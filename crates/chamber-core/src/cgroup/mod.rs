//! Cgroup compatibility mounts.
//!
//! Init systems refuse to boot without a cgroup hierarchy at
//! `/sys/fs/cgroup`. Nothing here limits resources: the guest gets either a
//! unified cgroup2 mount or a tmpfs holding a named v1 `systemd` hierarchy,
//! depending on what the host kernel supports.

use std::path::Path;

use chamber_common::error::{ChamberError, Result};
use nix::mount::MsFlags;

use crate::filesystem::mount::{ensure_dir, mount_fs};

/// Hierarchy layout mounted for the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupLayout {
    /// Unified cgroup2 hierarchy directly at `sys/fs/cgroup`.
    Unified,
    /// Legacy named hierarchy at `sys/fs/cgroup/systemd`.
    NamedSystemd,
}

/// Returns the filesystem types listed in `/proc/filesystems` text.
#[must_use]
pub fn parse_supported_filesystems(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split_whitespace().last())
        .map(str::to_string)
        .collect()
}

/// Picks the layout from `/proc/filesystems` text.
#[must_use]
pub fn choose_layout(filesystems: &str) -> CgroupLayout {
    if parse_supported_filesystems(filesystems)
        .iter()
        .any(|fs| fs == "cgroup2")
    {
        CgroupLayout::Unified
    } else {
        CgroupLayout::NamedSystemd
    }
}

/// Mounts the placeholder hierarchy under `<root>/sys/fs/cgroup`.
///
/// The legacy layout sits on a tmpfs so the named hierarchy has a
/// writable parent directory.
///
/// # Errors
///
/// Returns an error if the tmpfs or the cgroup mount fails. Callers treat
/// the whole step as best-effort.
pub fn mount_placeholder(root: &Path, proc_root: &Path) -> Result<CgroupLayout> {
    let filesystems_path = proc_root.join("filesystems");
    let filesystems = std::fs::read_to_string(&filesystems_path)
        .map_err(|e| ChamberError::io(&filesystems_path, e))?;
    let layout = choose_layout(&filesystems);

    let base = root.join("sys").join("fs").join("cgroup");
    ensure_dir(&base)?;
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    match layout {
        CgroupLayout::Unified => mount_fs("cgroup2", &base, "cgroup2", flags, None)?,
        CgroupLayout::NamedSystemd => {
            mount_fs("tmpfs", &base, "tmpfs", flags, Some("mode=0755"))?;
            let named = base.join("systemd");
            ensure_dir(&named)?;
            mount_fs("cgroup", &named, "cgroup", flags, Some("none,name=systemd"))?;
        }
    }
    tracing::info!(?layout, "cgroup placeholder mounted");
    Ok(layout)
}
