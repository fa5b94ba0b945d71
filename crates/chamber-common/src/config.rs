//! Configuration models: the per-container descriptor and runtime settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{self, DEFAULT_TTYS, MAX_BIND_MOUNTS, MAX_TTYS};
use crate::error::{ChamberError, Result};
use crate::types::ContainerName;

/// Where the guest root filesystem comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum RootfsSource {
    /// A plain directory, bind-mounted onto itself at boot.
    Directory(PathBuf),
    /// A filesystem image, loop-mounted before boot.
    Image(PathBuf),
}

impl RootfsSource {
    /// Path of the directory or image.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Directory(p) | Self::Image(p) => p,
        }
    }

    /// Whether the rootfs is backed by an image file.
    #[must_use]
    pub const fn is_image(&self) -> bool {
        matches!(self, Self::Image(_))
    }
}

/// Optional behaviors toggled per container.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Expose live host devices and a writable `/sys` (trusted guests only).
    pub hw_access: bool,
    /// Enable IPv6 on the shared host network stack.
    pub ipv6: bool,
    /// Switch the host security module to permissive before boot.
    pub selinux_permissive: bool,
    /// Discard every rootfs change when the container stops.
    pub volatile: bool,
}

/// A host path made visible inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Host source path.
    pub source: PathBuf,
    /// Absolute target path inside the guest.
    pub target: PathBuf,
}

impl BindMount {
    /// Parses `SRC:DST`.
    ///
    /// # Errors
    ///
    /// Returns an error if either side is missing or the target is relative.
    pub fn parse(raw: &str) -> Result<Self> {
        let (source, target) = raw.split_once(':').ok_or_else(|| ChamberError::Config {
            message: format!("bind mount must be SRC:DST, got {raw:?}"),
        })?;
        if source.is_empty() || target.is_empty() {
            return Err(ChamberError::Config {
                message: format!("bind mount has an empty side: {raw:?}"),
            });
        }
        let bind = Self {
            source: PathBuf::from(source),
            target: PathBuf::from(target),
        };
        bind.validate()?;
        Ok(bind)
    }

    fn validate(&self) -> Result<()> {
        if !self.target.is_absolute() {
            return Err(ChamberError::Config {
                message: format!("bind target must be absolute: {}", self.target.display()),
            });
        }
        if self
            .target
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ChamberError::Config {
                message: format!("bind target must not contain '..': {}", self.target.display()),
            });
        }
        Ok(())
    }
}

/// Immutable descriptor of a container, built once before namespace creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container name.
    pub name: ContainerName,
    /// Root filesystem source.
    pub rootfs: RootfsSource,
    /// Guest hostname.
    pub hostname: String,
    /// DNS servers written to the guest resolver configuration.
    pub dns: Vec<String>,
    /// Feature toggles.
    pub features: FeatureFlags,
    /// Extra bind mounts.
    pub binds: Vec<BindMount>,
    /// Whether the caller stays attached to the console.
    pub foreground: bool,
    /// Number of virtual terminals besides the console.
    pub tty_count: u8,
}

impl ContainerConfig {
    /// Starts building a config for the given name and rootfs.
    pub fn builder(name: impl Into<String>, rootfs: RootfsSource) -> ContainerConfigBuilder {
        ContainerConfigBuilder::new(name, rootfs)
    }

    /// DNS servers to write, falling back to the defaults.
    #[must_use]
    pub fn effective_dns(&self) -> Vec<String> {
        if self.dns.is_empty() {
            constants::DEFAULT_DNS.iter().map(|s| (*s).to_string()).collect()
        } else {
            self.dns.clone()
        }
    }
}

/// Builder validating every field of a [`ContainerConfig`].
#[derive(Debug)]
pub struct ContainerConfigBuilder {
    name: String,
    rootfs: RootfsSource,
    hostname: Option<String>,
    dns: Vec<String>,
    features: FeatureFlags,
    binds: Vec<BindMount>,
    foreground: bool,
    tty_count: u8,
}

impl ContainerConfigBuilder {
    /// Creates a builder with defaults: background mode, six terminals.
    #[must_use]
    pub fn new(name: impl Into<String>, rootfs: RootfsSource) -> Self {
        Self {
            name: name.into(),
            rootfs,
            hostname: None,
            dns: Vec::new(),
            features: FeatureFlags::default(),
            binds: Vec::new(),
            foreground: false,
            tty_count: DEFAULT_TTYS,
        }
    }

    /// Sets the guest hostname (defaults to the container name).
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Adds a DNS server.
    #[must_use]
    pub fn dns(mut self, server: impl Into<String>) -> Self {
        self.dns.push(server.into());
        self
    }

    /// Replaces the feature flags.
    #[must_use]
    pub const fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Adds a bind mount.
    #[must_use]
    pub fn bind(mut self, bind: BindMount) -> Self {
        self.binds.push(bind);
        self
    }

    /// Keeps the caller attached to the console.
    #[must_use]
    pub const fn foreground(mut self, foreground: bool) -> Self {
        self.foreground = foreground;
        self
    }

    /// Sets the number of virtual terminals.
    #[must_use]
    pub const fn tty_count(mut self, count: u8) -> Self {
        self.tty_count = count;
        self
    }

    /// Validates and freezes the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the name, hostname, rootfs, DNS list, bind
    /// list, or terminal count is invalid.
    pub fn build(self) -> Result<ContainerConfig> {
        let name = ContainerName::new(self.name)?;
        let hostname = self.hostname.unwrap_or_else(|| name.as_str().to_string());
        validate_hostname(&hostname)?;
        validate_rootfs(&self.rootfs)?;

        if self.tty_count > MAX_TTYS {
            return Err(ChamberError::Config {
                message: format!("at most {MAX_TTYS} terminals are supported, got {}", self.tty_count),
            });
        }
        if self.binds.len() > MAX_BIND_MOUNTS {
            return Err(ChamberError::Config {
                message: format!("at most {MAX_BIND_MOUNTS} bind mounts are supported, got {}", self.binds.len()),
            });
        }
        for bind in &self.binds {
            bind.validate()?;
        }
        for server in &self.dns {
            if server.parse::<std::net::IpAddr>().is_err() {
                return Err(ChamberError::Config {
                    message: format!("DNS server is not an IP address: {server}"),
                });
            }
        }

        Ok(ContainerConfig {
            name,
            rootfs: self.rootfs,
            hostname,
            dns: self.dns,
            features: self.features,
            binds: self.binds,
            foreground: self.foreground,
            tty_count: self.tty_count,
        })
    }
}

fn validate_hostname(hostname: &str) -> Result<()> {
    let ok = !hostname.is_empty()
        && hostname.len() <= 63
        && !hostname.starts_with('-')
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(ChamberError::Config {
            message: format!("invalid hostname: {hostname:?}"),
        })
    }
}

fn validate_rootfs(rootfs: &RootfsSource) -> Result<()> {
    match rootfs {
        RootfsSource::Directory(path) if !path.is_dir() => Err(ChamberError::Config {
            message: format!("rootfs directory does not exist: {}", path.display()),
        }),
        RootfsSource::Image(path) if !path.is_file() => Err(ChamberError::Config {
            message: format!("rootfs image does not exist: {}", path.display()),
        }),
        RootfsSource::Directory(path) | RootfsSource::Image(path) if !path.is_absolute() => {
            Err(ChamberError::Config {
                message: format!("rootfs path must be absolute: {}", path.display()),
            })
        }
        _ => Ok(()),
    }
}

/// Timing of the PID discovery retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryTimings {
    /// Interval during the initial burst.
    pub fast_interval: Duration,
    /// Length of the initial burst.
    pub fast_window: Duration,
    /// Interval after the burst.
    pub slow_interval: Duration,
    /// Total budget before giving up.
    pub total: Duration,
}

impl Default for DiscoveryTimings {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_millis(100),
            fast_window: Duration::from_secs(1),
            slow_interval: Duration::from_millis(500),
            total: Duration::from_secs(10),
        }
    }
}

/// Bounds of the staged stop escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTimeouts {
    /// Wait after the graceful action.
    pub graceful: Duration,
    /// Wait after the terminate signal.
    pub terminate: Duration,
    /// Wait after the kill signal before giving up on observing the exit.
    pub kill: Duration,
    /// Interval between liveness polls.
    pub poll: Duration,
}

impl Default for StopTimeouts {
    fn default() -> Self {
        Self {
            graceful: Duration::from_secs(1),
            terminate: Duration::from_secs(5),
            kill: Duration::from_secs(1),
            poll: Duration::from_millis(50),
        }
    }
}

/// Process-wide settings of the runtime, constructed explicitly and passed
/// down by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Base directory for chamber state.
    pub data_dir: PathBuf,
    /// Mount point of the host procfs.
    pub proc_root: PathBuf,
    /// Discovery retry timing.
    pub discovery: DiscoveryTimings,
    /// Stop escalation bounds.
    pub stop: StopTimeouts,
    /// Pause between stop and start during restart.
    pub restart_pause: Duration,
    /// External network/DNS helper invoked during boot, best-effort.
    pub network_hook: Option<PathBuf>,
}

impl RuntimeSettings {
    /// Settings rooted at a specific data directory.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Directory holding one record per container.
    #[must_use]
    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("containers")
    }

    /// Directory holding console logs of background containers.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Directory holding image mount points.
    #[must_use]
    pub fn mounts_dir(&self) -> PathBuf {
        self.data_dir.join("mnt")
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            data_dir: constants::default_data_dir(),
            proc_root: PathBuf::from("/proc"),
            discovery: DiscoveryTimings::default(),
            stop: StopTimeouts::default(),
            restart_pause: Duration::from_millis(500),
            network_hook: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rootfs() -> (tempfile::TempDir, RootfsSource) {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = RootfsSource::Directory(dir.path().to_path_buf());
        (dir, src)
    }

    #[test]
    fn builder_defaults_hostname_to_name() {
        let (_dir, src) = rootfs();
        let cfg = ContainerConfig::builder("alpine-test", src).build().unwrap();
        assert_eq!(cfg.hostname, "alpine-test");
        assert_eq!(cfg.tty_count, DEFAULT_TTYS);
        assert!(!cfg.foreground);
    }

    #[test]
    fn builder_rejects_missing_rootfs() {
        let src = RootfsSource::Directory(PathBuf::from("/nonexistent/chamber/rootfs"));
        assert!(ContainerConfig::builder("a", src).build().is_err());
    }

    #[test]
    fn builder_rejects_image_that_is_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = RootfsSource::Image(dir.path().to_path_buf());
        assert!(ContainerConfig::builder("a", src).build().is_err());
    }

    #[test]
    fn builder_bounds_terminals_and_binds() {
        let (_dir, src) = rootfs();
        assert!(
            ContainerConfig::builder("a", src.clone())
                .tty_count(MAX_TTYS + 1)
                .build()
                .is_err()
        );

        let mut builder = ContainerConfig::builder("a", src);
        for i in 0..=MAX_BIND_MOUNTS {
            builder = builder.bind(BindMount {
                source: PathBuf::from("/tmp"),
                target: PathBuf::from(format!("/mnt/{i}")),
            });
        }
        assert!(builder.build().is_err());
    }

    #[test]
    fn builder_rejects_bad_dns_and_hostname() {
        let (_dir, src) = rootfs();
        assert!(
            ContainerConfig::builder("a", src.clone())
                .dns("not-an-ip")
                .build()
                .is_err()
        );
        assert!(
            ContainerConfig::builder("a", src)
                .hostname("bad host")
                .build()
                .is_err()
        );
    }

    #[test]
    fn effective_dns_falls_back_to_defaults() {
        let (_dir, src) = rootfs();
        let cfg = ContainerConfig::builder("a", src.clone()).build().unwrap();
        assert_eq!(cfg.effective_dns(), vec!["1.1.1.1", "8.8.8.8"]);

        let cfg = ContainerConfig::builder("a", src).dns("9.9.9.9").build().unwrap();
        assert_eq!(cfg.effective_dns(), vec!["9.9.9.9"]);
    }

    #[test]
    fn bind_mount_parse() {
        let bind = BindMount::parse("/sdcard:/mnt/sdcard").unwrap();
        assert_eq!(bind.source, PathBuf::from("/sdcard"));
        assert_eq!(bind.target, PathBuf::from("/mnt/sdcard"));
        assert!(BindMount::parse("/sdcard").is_err());
        assert!(BindMount::parse("/sdcard:relative").is_err());
        assert!(BindMount::parse("/a:/b/../etc").is_err());
    }

    #[test]
    fn config_survives_serde() {
        let (_dir, src) = rootfs();
        let cfg = ContainerConfig::builder("web", src)
            .features(FeatureFlags {
                hw_access: true,
                ..FeatureFlags::default()
            })
            .build()
            .unwrap();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ContainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn settings_derive_subdirectories() {
        let settings = RuntimeSettings::with_data_dir("/var/lib/chamber");
        assert_eq!(settings.records_dir(), PathBuf::from("/var/lib/chamber/containers"));
        assert_eq!(settings.logs_dir(), PathBuf::from("/var/lib/chamber/logs"));
        assert_eq!(settings.stop.graceful, Duration::from_secs(1));
        assert_eq!(settings.stop.terminate, Duration::from_secs(5));
    }
}
