//! Loop mounting of block-image root filesystems.
//!
//! The host `mount` helper is used instead of driving `/dev/loop-control`
//! directly: it already handles loop device allocation on kernels with and
//! without `LOOP_CTL_GET_FREE`.

use std::path::{Path, PathBuf};
use std::process::Command;

use chamber_common::error::{ChamberError, Result};

use super::mount::{ensure_dir, is_mount_point, unmount};

fn helper(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|e| ChamberError::Requirements {
        message: format!("`{name}` helper not found: {e}"),
    })
}

/// Loop-mounts `image` read-write at `target`.
///
/// Returns `false` when `target` was already a mount point (a restart that
/// preserved the previous mount) and nothing was done.
///
/// # Errors
///
/// Returns an error if the helper is missing or the mount fails.
pub fn mount_image(image: &Path, target: &Path) -> Result<bool> {
    ensure_dir(target)?;
    if is_mount_point(target)? {
        tracing::info!(target = %target.display(), "image already mounted, reusing");
        return Ok(false);
    }

    let mount = helper("mount")?;
    let output = Command::new(&mount)
        .args(["-o", "loop,rw"])
        .arg(image)
        .arg(target)
        .output()
        .map_err(|e| ChamberError::io(&mount, e))?;
    if !output.status.success() {
        return Err(ChamberError::Mount {
            target: target.to_path_buf(),
            message: format!(
                "loop mount of {} failed: {}",
                image.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    tracing::info!(image = %image.display(), target = %target.display(), "image mounted");
    Ok(true)
}

/// Unmounts a loop-mounted image, detaching lazily if it is still busy.
///
/// # Errors
///
/// Returns an error if the image stays mounted.
pub fn unmount_image(target: &Path) -> Result<()> {
    if !is_mount_point(target)? {
        return Ok(());
    }
    if unmount(target, false).is_err() {
        tracing::warn!(target = %target.display(), "image busy, detaching lazily");
        unmount(target, true)?;
    }
    // Best-effort: the mount point may be shared with a later restart.
    let _ = std::fs::remove_dir(target);
    tracing::info!(target = %target.display(), "image unmounted");
    Ok(())
}
