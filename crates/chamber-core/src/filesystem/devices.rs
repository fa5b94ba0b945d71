//! Construction of the guest `/dev`.
//!
//! Normal containers get a private tmpfs with a fixed set of device nodes.
//! Hardware passthrough mounts the kernel's shared devtmpfs instead, which
//! exposes real devices but is one instance for the whole machine: nodes
//! replaced inside the guest disappear for the host too, so
//! [`restore_host_nodes`] repairs them when the container stops.

use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;

use chamber_common::error::{ChamberError, Result};
use nix::mount::MsFlags;
use nix::sys::stat::{Mode, SFlag, makedev, mknod};

use super::mount::{ensure_dir, mount_fs};

/// How `/dev` is provided to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevMode {
    /// Private tmpfs populated with [`STANDARD_NODES`].
    Static,
    /// Shared devtmpfs (hardware passthrough).
    Passthrough,
}

/// A character device node created under `/dev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    /// File name below `/dev`.
    pub name: &'static str,
    /// Major number.
    pub major: u64,
    /// Minor number.
    pub minor: u64,
    /// Permission bits.
    pub mode: u32,
}

/// Nodes every guest `/dev` carries.
pub const STANDARD_NODES: &[DeviceNode] = &[
    DeviceNode { name: "null", major: 1, minor: 3, mode: 0o666 },
    DeviceNode { name: "zero", major: 1, minor: 5, mode: 0o666 },
    DeviceNode { name: "full", major: 1, minor: 7, mode: 0o666 },
    DeviceNode { name: "random", major: 1, minor: 8, mode: 0o666 },
    DeviceNode { name: "urandom", major: 1, minor: 9, mode: 0o666 },
    DeviceNode { name: "tty", major: 5, minor: 0, mode: 0o666 },
    DeviceNode { name: "console", major: 5, minor: 1, mode: 0o600 },
    DeviceNode { name: "ptmx", major: 5, minor: 2, mode: 0o666 },
];

/// Nodes that collide with the guest's own console plumbing and are
/// recreated after mounting devtmpfs.
const PASSTHROUGH_REPLACED: &[&str] = &["console", "tty", "null", "zero", "random", "urandom", "ptmx"];

const STDIO_LINKS: &[(&str, &str)] = &[
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

fn node(name: &str) -> Option<&'static DeviceNode> {
    STANDARD_NODES.iter().find(|n| n.name == name)
}

/// Creates one character device node, replacing whatever is at its path.
///
/// # Errors
///
/// Returns an error if `mknod(2)` fails.
pub fn create_node(dev_dir: &Path, node: &DeviceNode) -> Result<()> {
    let path = dev_dir.join(node.name);
    if path.symlink_metadata().is_ok() {
        std::fs::remove_file(&path).map_err(|e| ChamberError::io(&path, e))?;
    }
    mknod(
        &path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(node.mode),
        makedev(node.major, node.minor),
    )
    .map_err(|e| ChamberError::Mount {
        target: path.clone(),
        message: format!("mknod {}:{}: {e}", node.major, node.minor),
    })?;
    // mknod is filtered by the umask; restore the intended bits.
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(node.mode))
        .map_err(|e| ChamberError::io(&path, e))
}

/// Mounts and populates `<root>/dev`.
///
/// Sub-mounts (`pts`, `shm`, `mqueue`) and the `/proc/self/fd` links are
/// created in both modes. The devpts instance itself is mounted after the
/// root switch.
///
/// # Errors
///
/// Returns an error if the `/dev` mount or a mandatory node fails.
pub fn populate_dev(root: &Path, mode: DevMode) -> Result<()> {
    let dev = root.join("dev");
    ensure_dir(&dev)?;

    match mode {
        DevMode::Static => {
            mount_fs(
                "tmpfs",
                &dev,
                "tmpfs",
                MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
                Some("mode=0755,size=65536k"),
            )?;
            for n in STANDARD_NODES {
                create_node(&dev, n)?;
            }
        }
        DevMode::Passthrough => {
            mount_fs("devtmpfs", &dev, "devtmpfs", MsFlags::MS_NOSUID, Some("mode=0755"))?;
            for name in PASSTHROUGH_REPLACED {
                if let Some(n) = node(name) {
                    create_node(&dev, n)?;
                }
            }
        }
    }

    ensure_dir(&dev.join("pts"))?;
    let shm = dev.join("shm");
    ensure_dir(&shm)?;
    mount_fs(
        "tmpfs",
        &shm,
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=1777"),
    )?;
    create_stdio_links(&dev)?;

    if let Err(e) = crate::namespace::ipc::mount_mqueue(&dev) {
        tracing::warn!(error = %e, "mqueue unavailable, continuing");
    }
    tracing::debug!(?mode, dev = %dev.display(), "/dev populated");
    Ok(())
}

/// Creates `fd`, `stdin`, `stdout` and `stderr` links under `dev_dir`.
///
/// # Errors
///
/// Returns an error if a link cannot be created.
pub fn create_stdio_links(dev_dir: &Path) -> Result<()> {
    for (name, target) in STDIO_LINKS {
        let link = dev_dir.join(name);
        if link.symlink_metadata().is_ok() {
            continue;
        }
        symlink(target, &link).map_err(|e| ChamberError::io(&link, e))?;
    }
    Ok(())
}

/// Recreates standard host nodes missing from `dev_dir`.
///
/// Returns the names that were restored.
pub fn restore_host_nodes(dev_dir: &Path) -> Vec<&'static str> {
    let mut restored = Vec::new();
    for n in STANDARD_NODES {
        if dev_dir.join(n.name).symlink_metadata().is_ok() {
            continue;
        }
        match create_node(dev_dir, n) {
            Ok(()) => restored.push(n.name),
            Err(e) => tracing::warn!(node = n.name, error = %e, "could not restore host device node"),
        }
    }
    if !restored.is_empty() {
        tracing::info!(?restored, "restored host device nodes");
    }
    restored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_is_private() {
        let console = node("console").expect("console listed");
        assert_eq!((console.major, console.minor, console.mode), (5, 1, 0o600));
    }

    #[test]
    fn passthrough_replaces_only_known_nodes() {
        for name in PASSTHROUGH_REPLACED {
            assert!(node(name).is_some(), "{name} has no node definition");
        }
        assert!(!PASSTHROUGH_REPLACED.contains(&"full"));
    }

    #[test]
    fn stdio_links_are_created_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        create_stdio_links(dir.path()).expect("links");
        create_stdio_links(dir.path()).expect("idempotent");
        let target = std::fs::read_link(dir.path().join("stdout")).expect("readlink");
        assert_eq!(target, Path::new("/proc/self/fd/1"));
    }
}
