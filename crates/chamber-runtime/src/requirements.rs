//! Host requirement checks run before every start.

use std::path::Path;

use chamber_common::error::{ChamberError, Result};
use chamber_core::cgroup::parse_supported_filesystems;
use chamber_core::namespace::NamespaceKind;

/// Filesystems the boot sequence mounts unconditionally.
pub const REQUIRED_FILESYSTEMS: &[&str] = &["proc", "sysfs", "tmpfs", "devpts"];

/// Information about the host and its namespace support.
#[derive(Debug, Clone)]
pub struct HostReport {
    /// Host operating system name.
    pub os: String,
    /// Host CPU architecture.
    pub arch: String,
    /// Whether the caller runs with effective UID 0.
    pub is_root: bool,
    /// Whether the host looks like Android.
    pub android: bool,
    /// Namespace kinds missing under `/proc/self/ns`.
    pub missing_namespaces: Vec<&'static str>,
    /// Filesystem types the kernel supports.
    pub filesystems: Vec<String>,
    /// Whether the `mount` helper needed for image roots is installed.
    pub mount_helper: bool,
}

impl HostReport {
    /// Required filesystems the kernel does not list.
    #[must_use]
    pub fn missing_filesystems(&self) -> Vec<&'static str> {
        REQUIRED_FILESYSTEMS
            .iter()
            .copied()
            .filter(|fs| !self.filesystems.iter().any(|have| have == fs))
            .collect()
    }

    /// Whether the kernel supports overlay roots for volatile mode.
    #[must_use]
    pub fn supports_overlay(&self) -> bool {
        self.filesystems.iter().any(|fs| fs == "overlay")
    }

    /// Fails with [`ChamberError::Requirements`] listing every unmet
    /// requirement.
    ///
    /// # Errors
    ///
    /// Returns an error if anything is missing.
    pub fn ensure_ready(&self) -> Result<()> {
        let mut problems = Vec::new();
        if !self.is_root {
            problems.push("must run as root".to_string());
        }
        if !self.missing_namespaces.is_empty() {
            problems.push(format!("missing namespaces: {}", self.missing_namespaces.join(", ")));
        }
        let missing_fs = self.missing_filesystems();
        if !missing_fs.is_empty() {
            problems.push(format!("missing filesystems: {}", missing_fs.join(", ")));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ChamberError::Requirements {
                message: problems.join("; "),
            })
        }
    }
}

/// Inspects the host through `proc_root`.
#[must_use]
pub fn inspect(proc_root: &Path) -> HostReport {
    let ns_dir = proc_root.join("self").join("ns");
    let missing_namespaces = NamespaceKind::ALL
        .iter()
        .map(|k| k.proc_name())
        .filter(|name| !ns_dir.join(name).exists())
        .collect();
    let filesystems = std::fs::read_to_string(proc_root.join("filesystems"))
        .map(|text| parse_supported_filesystems(&text))
        .unwrap_or_default();
    HostReport {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        is_root: nix::unistd::geteuid().is_root(),
        android: cfg!(target_os = "android") || Path::new("/system/build.prop").exists(),
        missing_namespaces,
        filesystems,
        mount_helper: which::which("mount").is_ok(),
    }
}
