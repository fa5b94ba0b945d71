//! Root filesystem switching via `pivot_root(2)`.
//!
//! `pivot_root` actually changes the root mount instead of only the
//! process's view of `/`. Kernels booted from a ramfs root (common on
//! Android) refuse it with `EINVAL`; those fall back to moving the new
//! root over `/` and `chroot`ing into it.

use std::path::{Path, PathBuf};

use chamber_common::constants::OLD_ROOT_DIR;
use chamber_common::error::{ChamberError, Result};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::unistd::{chdir, chroot, pivot_root};

use super::mount::{bind_mount, ensure_dir};

/// How the root switch was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootSwitch {
    /// `pivot_root(2)` succeeded; the host root is at `/.old_root`.
    Pivoted,
    /// `MS_MOVE` + `chroot` was used; only `/.old_root/dev/pts` is reachable.
    MovedAndChrooted,
}

/// Directory under the new root where host paths stay reachable after the
/// switch, absolute as seen from inside the guest.
#[must_use]
pub fn old_root_path() -> PathBuf {
    Path::new("/").join(OLD_ROOT_DIR)
}

/// Makes `new_root` the process root.
///
/// The caller must already have `new_root` as a mount point in a private
/// mount namespace. When `pivot_root(2)` is refused with `EINVAL`, the host
/// `/dev/pts` is bound under `.old_root/dev/pts` first so PTY slave paths
/// allocated on the host resolve the same way under either strategy.
///
/// # Errors
///
/// Returns an error if both strategies fail.
pub fn switch_root(new_root: &Path) -> Result<RootSwitch> {
    chdir(new_root).map_err(|e| ChamberError::Mount {
        target: new_root.to_path_buf(),
        message: format!("chdir into new root: {e}"),
    })?;
    let put_old = new_root.join(OLD_ROOT_DIR);
    ensure_dir(&put_old)?;

    match pivot_root(".", OLD_ROOT_DIR) {
        Ok(()) => {
            chdir("/").map_err(|e| ChamberError::Mount {
                target: PathBuf::from("/"),
                message: format!("chdir after pivot_root: {e}"),
            })?;
            tracing::info!(new_root = %new_root.display(), "pivot_root complete");
            Ok(RootSwitch::Pivoted)
        }
        Err(Errno::EINVAL) => {
            tracing::warn!("pivot_root refused, falling back to MS_MOVE and chroot");
            move_and_chroot(new_root, &put_old)?;
            Ok(RootSwitch::MovedAndChrooted)
        }
        Err(e) => Err(ChamberError::Mount {
            target: new_root.to_path_buf(),
            message: format!("pivot_root: {e}"),
        }),
    }
}

fn move_and_chroot(new_root: &Path, put_old: &Path) -> Result<()> {
    let host_pts = put_old.join("dev").join("pts");
    ensure_dir(&host_pts)?;
    if let Err(e) = bind_mount(Path::new("/dev/pts"), &host_pts) {
        tracing::warn!(error = %e, "host devpts not reachable after chroot");
    }

    mount(Some(new_root), "/", None::<&str>, MsFlags::MS_MOVE, None::<&str>).map_err(|e| {
        ChamberError::Mount {
            target: new_root.to_path_buf(),
            message: format!("move new root over /: {e}"),
        }
    })?;
    chroot(".").map_err(|e| ChamberError::Mount {
        target: new_root.to_path_buf(),
        message: format!("chroot: {e}"),
    })?;
    chdir("/").map_err(|e| ChamberError::Mount {
        target: PathBuf::from("/"),
        message: format!("chdir after chroot: {e}"),
    })?;
    tracing::info!(new_root = %new_root.display(), "moved and chrooted into new root");
    Ok(())
}

/// Detaches the old root and removes its now-empty mount point.
///
/// Only empty directories are removed so a detach that has not fully
/// propagated can never delete host files.
///
/// # Errors
///
/// Returns an error if the old root cannot be detached.
pub fn detach_old_root(switch: RootSwitch) -> Result<()> {
    let old_root = old_root_path();
    if switch == RootSwitch::MovedAndChrooted {
        let pts = old_root.join("dev").join("pts");
        let _ = umount2(&pts, MntFlags::MNT_DETACH);
        remove_empty_chain(&pts, &old_root);
        return Ok(());
    }

    umount2(&old_root, MntFlags::MNT_DETACH).map_err(|e| ChamberError::Mount {
        target: old_root.clone(),
        message: format!("detach old root: {e}"),
    })?;
    remove_empty_chain(&old_root, &old_root);
    tracing::debug!("old root detached");
    Ok(())
}

/// Removes `leaf` and each parent up to and including `stop`, halting at
/// the first directory that is not empty.
fn remove_empty_chain(leaf: &Path, stop: &Path) {
    let mut current = Some(leaf);
    while let Some(dir) = current {
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        if dir == stop {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_root_is_absolute() {
        assert_eq!(old_root_path(), PathBuf::from("/.old_root"));
    }

    #[test]
    fn empty_chain_removal_stops_at_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old_root = dir.path().join(".old_root");
        let pts = old_root.join("dev").join("pts");
        std::fs::create_dir_all(&pts).expect("mkdir");
        std::fs::write(old_root.join("keep"), b"x").expect("write");

        remove_empty_chain(&pts, &old_root);
        assert!(!pts.exists());
        assert!(!old_root.join("dev").exists());
        assert!(old_root.join("keep").exists());
    }

    #[test]
    fn empty_chain_removal_clears_everything_when_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old_root = dir.path().join(".old_root");
        let pts = old_root.join("dev").join("pts");
        std::fs::create_dir_all(&pts).expect("mkdir");

        remove_empty_chain(&pts, &old_root);
        assert!(!old_root.exists());
        assert!(dir.path().exists());
    }
}
