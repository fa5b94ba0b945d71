//! Mount utilities for container filesystem setup.
//!
//! Handles mounting `/proc`, `/sys`, `/run`, bind mounts, and mount-point
//! detection inside the container's namespace.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chamber_common::error::{ChamberError, Result};
use nix::mount::{MntFlags, MsFlags, mount, umount2};

/// How `/sys` is exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysfsMode {
    /// Read-only, except a writable network-device subtree.
    ReadOnly,
    /// Fully writable (hardware passthrough).
    Writable,
}

/// Subtree of `/sys` left writable in [`SysfsMode::ReadOnly`] so udev-like
/// tools can still discover network devices.
pub const WRITABLE_SYS_SUBTREE: &str = "devices/virtual/net";

/// Creates a directory and its parents.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| ChamberError::io(path, e))
}

/// Creates an empty regular file (and its parents) to serve as a bind target.
///
/// Existing files and device nodes are left untouched.
///
/// # Errors
///
/// Returns an error if the file or its parents cannot be created.
pub fn ensure_file(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let _ = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| ChamberError::io(path, e))?;
    Ok(())
}

/// Mounts a filesystem of the given type.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn mount_fs(source: &str, target: &Path, fstype: &str, flags: MsFlags, data: Option<&str>) -> Result<()> {
    mount(Some(source), target, Some(fstype), flags, data).map_err(|e| ChamberError::Mount {
        target: target.to_path_buf(),
        message: format!("mount {fstype}: {e}"),
    })?;
    tracing::debug!(fstype, target = %target.display(), "mounted");
    Ok(())
}

/// Creates a recursive bind mount from source to target.
///
/// # Errors
///
/// Returns an error if the bind fails.
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| ChamberError::Mount {
        target: target.to_path_buf(),
        message: format!("bind {}: {e}", source.display()),
    })?;
    tracing::debug!(source = %source.display(), target = %target.display(), "bind mounted");
    Ok(())
}

/// Makes the mount at `target` read-only for this mount point only, with
/// `keep` as its remaining per-mount flags.
///
/// The superblock is untouched, so other mounts of the same filesystem
/// (the host's `/sys`, for one) keep their own flags.
///
/// # Errors
///
/// Returns an error if the remount is refused.
pub fn remount_readonly(target: &Path, keep: MsFlags) -> Result<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | keep,
        None::<&str>,
    )
    .map_err(|e| ChamberError::Mount {
        target: target.to_path_buf(),
        message: format!("remount read-only: {e}"),
    })?;
    tracing::debug!(target = %target.display(), "remounted read-only");
    Ok(())
}

/// Unmounts `target`, lazily when `detach` is set.
///
/// # Errors
///
/// Returns an error if `umount2(2)` fails.
pub fn unmount(target: &Path, detach: bool) -> Result<()> {
    let flags = if detach {
        MntFlags::MNT_DETACH
    } else {
        MntFlags::empty()
    };
    umount2(target, flags).map_err(|e| ChamberError::Mount {
        target: target.to_path_buf(),
        message: format!("unmount: {e}"),
    })?;
    tracing::debug!(target = %target.display(), detach, "unmounted");
    Ok(())
}

/// Mounts a fresh procfs at `<root>/proc`.
///
/// # Errors
///
/// Returns an error if the mount fails.
pub fn mount_proc(root: &Path) -> Result<()> {
    let target = root.join("proc");
    ensure_dir(&target)?;
    mount_fs(
        "proc",
        &target,
        "proc",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None,
    )
}

/// Mounts sysfs at `<root>/sys` according to `mode`.
///
/// In read-only mode the network-device subtree is first bound onto itself
/// so it survives as a separate writable mount, then the guest's sysfs
/// mount point is flipped to read-only. The guest shares the host's network
/// namespace and with it the sysfs superblock, so only per-mount flags may
/// change.
///
/// # Errors
///
/// Returns an error if the sysfs mount or the read-only remount fails.
pub fn mount_sys(root: &Path, mode: SysfsMode) -> Result<()> {
    let target = root.join("sys");
    ensure_dir(&target)?;
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    mount_fs("sysfs", &target, "sysfs", flags, None)?;
    if mode == SysfsMode::Writable {
        return Ok(());
    }

    let net = target.join(WRITABLE_SYS_SUBTREE);
    if net.is_dir() {
        if let Err(e) = bind_mount(&net, &net) {
            tracing::warn!(error = %e, "writable network sysfs subtree unavailable");
        }
    }
    remount_readonly(&target, flags)
}

/// Mounts a fresh tmpfs at `<root>/run`.
///
/// # Errors
///
/// Returns an error if the mount fails.
pub fn mount_run(root: &Path) -> Result<()> {
    let target = root.join("run");
    ensure_dir(&target)?;
    mount_fs(
        "tmpfs",
        &target,
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=0755"),
    )
}

/// Extracts the mount points listed in `/proc/<pid>/mountinfo` text.
///
/// Octal escapes (`\040` for space and friends) are decoded.
#[must_use]
pub fn parse_mount_points(mountinfo: &str) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|raw| PathBuf::from(unescape_octal(raw)))
        .collect()
}

fn unescape_octal(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b));
        if escaped {
            let code = bytes[i + 1..=i + 3]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(u8::try_from(code).unwrap_or(b'?'));
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `path` is a mount point in the caller's mount namespace.
///
/// # Errors
///
/// Returns an error if `/proc/self/mountinfo` cannot be read.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    let info_path = Path::new("/proc/self/mountinfo");
    let info = std::fs::read_to_string(info_path).map_err(|e| ChamberError::io(info_path, e))?;
    let wanted = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    Ok(parse_mount_points(&info).iter().any(|p| *p == wanted))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:5 / /dev rw,nosuid shared:2 - devtmpfs udev rw
61 22 7:0 / /var/lib/chamber/mnt/my\\040box rw - ext4 /dev/loop0 rw
";

    #[test]
    fn mount_points_are_parsed_and_unescaped() {
        let points = parse_mount_points(MOUNTINFO);
        assert_eq!(
            points,
            vec![
                PathBuf::from("/"),
                PathBuf::from("/dev"),
                PathBuf::from("/var/lib/chamber/mnt/my box"),
            ]
        );
    }

    #[test]
    fn root_is_a_mount_point() {
        assert!(is_mount_point(Path::new("/")).expect("mountinfo readable"));
    }

    #[test]
    fn plain_tempdir_is_not_a_mount_point() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sub = dir.path().join("sub");
        ensure_dir(&sub).expect("mkdir");
        assert!(!is_mount_point(&sub).expect("mountinfo readable"));
    }

    fn is_readonly(path: &Path) -> bool {
        nix::sys::statvfs::statvfs(path)
            .expect("statvfs")
            .flags()
            .contains(nix::sys::statvfs::FsFlags::ST_RDONLY)
    }

    /// Runs `check` in a forked child with a private mount namespace and
    /// returns whether it succeeded.
    fn in_private_mount_ns(check: impl FnOnce() -> bool) -> bool {
        // SAFETY: the child only mounts, inspects and exits.
        match unsafe { nix::unistd::fork() }.expect("fork") {
            nix::unistd::ForkResult::Child => {
                let ok = nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWNS).is_ok()
                    && crate::namespace::mount::make_root_private().is_ok()
                    && check();
                // SAFETY: leaves the child without running the parent's test harness.
                unsafe { libc::_exit(i32::from(!ok)) }
            }
            nix::unistd::ForkResult::Parent { child } => matches!(
                nix::sys::wait::waitpid(child, None),
                Ok(nix::sys::wait::WaitStatus::Exited(_, 0))
            ),
        }
    }

    #[test]
    #[ignore = "needs root"]
    fn readonly_guest_sysfs_leaves_other_sysfs_mounts_writable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().to_path_buf();
        assert!(in_private_mount_ns(move || {
            let host = path.join("host-sys");
            let guest = path.join("guest");
            if ensure_dir(&host).is_err() {
                return false;
            }
            let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
            if mount_fs("sysfs", &host, "sysfs", flags, None).is_err() || is_readonly(&host) {
                return false;
            }
            if mount_sys(&guest, SysfsMode::ReadOnly).is_err() {
                return false;
            }
            let net = guest.join("sys").join(WRITABLE_SYS_SUBTREE);
            is_readonly(&guest.join("sys")) && !is_readonly(&host) && (!net.is_dir() || !is_readonly(&net))
        }));
    }

    #[test]
    fn ensure_file_creates_parents_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("dev").join("tty1");
        ensure_file(&target).expect("create");
        std::fs::write(&target, b"keep").expect("write");
        ensure_file(&target).expect("idempotent");
        assert_eq!(std::fs::read(&target).expect("read"), b"keep");
    }
}
