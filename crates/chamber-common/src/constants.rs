//! System-wide constants and default paths.

use std::path::{Path, PathBuf};

/// Default base directory for chamber state on a regular Linux host.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/chamber";

/// Default base directory for chamber state on an Android host.
pub const ANDROID_DATA_DIR: &str = "/data/local/chamber";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CHAMBER_DATA_DIR";

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "CHAMBER_LOG";

/// Identity string written to the guest's container marker and checked
/// before any recorded PID is trusted.
pub const IDENTITY: &str = "chamber";

/// Container marker read by systemd to detect containerization,
/// relative to the guest root.
pub const CONTAINER_MARKER: &str = "run/systemd/container";

/// Marker holding the container name, relative to the guest root.
pub const NAME_MARKER: &str = "run/chamber/name";

/// Prefix of the marker seed file dropped into the rootfs before boot.
pub const SEED_PREFIX: &str = ".chamber-seed";

/// Directory the old root is moved to during the root switch.
pub const OLD_ROOT_DIR: &str = ".old_root";

/// Maximum number of user-supplied bind mounts.
pub const MAX_BIND_MOUNTS: usize = 16;

/// Maximum number of virtual terminals besides the console.
pub const MAX_TTYS: u8 = 12;

/// Default number of virtual terminals besides the console.
pub const DEFAULT_TTYS: u8 = 6;

/// Maximum length of a container name.
pub const MAX_NAME_LEN: usize = 64;

/// DNS servers written to the guest when none are configured.
pub const DEFAULT_DNS: &[&str] = &["1.1.1.1", "8.8.8.8"];

/// `PATH` exported to the guest init and entered shells.
pub const GUEST_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Init programs tried in order inside the guest.
pub const INIT_CANDIDATES: &[&str] = &["/sbin/init", "/lib/systemd/systemd", "/usr/lib/systemd/systemd"];

/// Interactive shells tried in order by `enter`.
pub const SHELL_CANDIDATES: &[&str] = &[
    "/bin/bash",
    "/usr/bin/bash",
    "/bin/zsh",
    "/usr/bin/zsh",
    "/bin/ash",
    "/bin/sh",
];

/// Application name used in CLI output and log lines.
pub const APP_NAME: &str = "chamber";

/// Returns the data directory for this host.
///
/// Honors `CHAMBER_DATA_DIR`, then prefers the Android location when
/// `/data/local` exists, falling back to `/var/lib/chamber`.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    if Path::new("/data/local").is_dir() {
        return PathBuf::from(ANDROID_DATA_DIR);
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}
