//! IPC namespace isolation.
//!
//! Isolates System V IPC objects and POSIX message queues. The queue
//! filesystem has to be mounted from inside the new IPC namespace to show
//! only the container's queues.

use std::path::Path;

use chamber_common::error::Result;
use nix::mount::MsFlags;

use crate::filesystem::mount::{ensure_dir, mount_fs};

/// Mounts a POSIX message queue filesystem at `dev/mqueue`.
///
/// # Errors
///
/// Returns an error if the directory or the mount cannot be created.
pub fn mount_mqueue(dev_dir: &Path) -> Result<()> {
    let target = dev_dir.join("mqueue");
    ensure_dir(&target)?;
    mount_fs(
        "mqueue",
        &target,
        "mqueue",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None,
    )
}
