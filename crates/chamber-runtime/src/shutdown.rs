//! Graceful shutdown policy.
//!
//! Different init systems expect different requests to power off from
//! inside a container. The policy maps the detected [`InitSystem`] to a
//! [`GracefulAction`]; [`DefaultShutdownPolicy`] encodes the usual
//! conventions and can be replaced through the [`ShutdownPolicy`] trait.

use std::fmt;
use std::path::Path;

use chamber_core::procfs;

/// Init system running as the guest's PID 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSystem {
    /// systemd.
    Systemd,
    /// `OpenRC` (on top of any `init`).
    OpenRc,
    /// `BusyBox` init.
    BusyBox,
    /// Classic `SysVinit`.
    SysV,
    /// Anything else.
    Unknown,
}

impl fmt::Display for InitSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Systemd => "systemd",
            Self::OpenRc => "openrc",
            Self::BusyBox => "busybox",
            Self::SysV => "sysvinit",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Facts about the guest root used to classify its init.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootMarkers {
    /// `/run/systemd/system` exists (created by a booted systemd).
    pub systemd_booted: bool,
    /// `/run/openrc` exists.
    pub openrc_running: bool,
    /// `/sbin/init` resolves to a `BusyBox` binary.
    pub init_is_busybox: bool,
}

impl RootMarkers {
    /// Reads the markers through `/proc/<pid>/root`.
    #[must_use]
    pub fn read(proc_root: &Path, pid: i32) -> Self {
        let in_root = |rel: &str| procfs::path_in_root(proc_root, pid, Path::new(rel));
        let init_is_busybox = std::fs::read_link(in_root("sbin/init"))
            .is_ok_and(|target| target.to_string_lossy().contains("busybox"));
        Self {
            systemd_booted: in_root("run/systemd/system").is_dir(),
            openrc_running: in_root("run/openrc").is_dir(),
            init_is_busybox,
        }
    }
}

/// Classifies an init from its `comm` and root markers.
#[must_use]
pub fn classify(comm: &str, markers: &RootMarkers) -> InitSystem {
    if comm == "systemd" || markers.systemd_booted {
        InitSystem::Systemd
    } else if markers.openrc_running || comm == "openrc-init" {
        InitSystem::OpenRc
    } else if comm == "busybox" || markers.init_is_busybox {
        InitSystem::BusyBox
    } else if comm == "init" {
        InitSystem::SysV
    } else {
        InitSystem::Unknown
    }
}

/// Detects the init system of a running guest.
#[must_use]
pub fn detect(proc_root: &Path, pid: i32) -> InitSystem {
    let comm = procfs::comm(proc_root, pid).unwrap_or_default();
    classify(&comm, &RootMarkers::read(proc_root, pid))
}

/// First step of a stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GracefulAction {
    /// Send this raw signal number to the guest init.
    Signal(i32),
    /// Run this command inside the guest.
    Command(Vec<String>),
}

/// Chooses how to ask a guest to shut down.
pub trait ShutdownPolicy {
    /// Graceful action for the given init system.
    fn graceful_action(&self, init: InitSystem) -> GracefulAction;
}

/// Conventional requests: `SIGRTMIN+3` for systemd, `SIGUSR2` for
/// `BusyBox`, `openrc-shutdown -p now` for `OpenRC`, `poweroff` otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultShutdownPolicy;

impl ShutdownPolicy for DefaultShutdownPolicy {
    fn graceful_action(&self, init: InitSystem) -> GracefulAction {
        match init {
            InitSystem::Systemd => GracefulAction::Signal(libc::SIGRTMIN() + 3),
            InitSystem::BusyBox => GracefulAction::Signal(libc::SIGUSR2),
            InitSystem::OpenRc => GracefulAction::Command(vec![
                "openrc-shutdown".into(),
                "-p".into(),
                "now".into(),
            ]),
            InitSystem::SysV | InitSystem::Unknown => GracefulAction::Command(vec!["poweroff".into()]),
        }
    }
}
