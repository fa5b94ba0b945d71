//! Namespace bootstrap: from a validated config to a running guest init.
//!
//! The runtime forks a *launcher*, which detaches from the terminal
//! session, creates the mount, UTS, IPC and PID namespaces and forks again.
//! That second child is PID 1 of the new PID namespace. It prepares the
//! root filesystem, switches into it and finally `execve`s the guest's init.
//! The launcher stays behind, waits for PID 1 and exits with its status,
//! which is how the host learns that a container has ended.
//!
//! Every step of the guest side is a [`BootStage`]; a failing mandatory
//! stage is reported as [`ChamberError::Boot`] naming the stage.

use std::convert::Infallible;
use std::ffi::CString;
use std::fmt;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use chamber_common::config::{BindMount, ContainerConfig};
use chamber_common::constants::{CONTAINER_MARKER, GUEST_PATH, IDENTITY, INIT_CANDIDATES, NAME_MARKER};
use chamber_common::error::{ChamberError, Result};
use chamber_common::types::MarkerToken;
use chamber_core::filesystem::devices::{DevMode, populate_dev};
use chamber_core::filesystem::mount::{
    SysfsMode, bind_mount, ensure_dir, ensure_file, mount_fs, mount_proc, mount_run, mount_sys,
};
use chamber_core::filesystem::overlayfs::volatile_root;
use chamber_core::filesystem::pivot_root::{detach_old_root, old_root_path, switch_root};
use chamber_core::namespace::{create_container_namespaces, mount::make_root_private};
use chamber_core::pty::SlavePaths;
use nix::mount::MsFlags;
use nix::unistd::{ForkResult, Pid, chdir, execve, fork, setsid};

use crate::network;
use crate::process::wait_exit_code;

/// Options for the guest's private devpts instance.
const DEVPTS_OPTIONS: &str = "newinstance,ptmxmode=0666,mode=0620";

/// One step of the boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    /// Launcher leaves the caller's session.
    Detach,
    /// Launcher creates the namespaces.
    Unshare,
    /// Launcher forks the namespace's PID 1.
    Fork,
    /// Mount propagation is cut and the root is made a mount point.
    PrivateRoot,
    /// Enter the root and consume the marker seed.
    Seed,
    /// `/dev` is built.
    Devices,
    /// `/proc` is mounted.
    Proc,
    /// `/sys` is mounted.
    Sys,
    /// `/run` is mounted.
    Run,
    /// `/run/<token>` is created.
    Marker,
    /// User bind mounts are applied.
    BindMounts,
    /// IPv6 toggle and network hook.
    HostNetwork,
    /// Cgroup compatibility mounts.
    Cgroups,
    /// `pivot_root` (or its fallback).
    SwitchRoot,
    /// Private devpts instance.
    Devpts,
    /// Console and TTY slaves are bound into `/dev`.
    Terminals,
    /// Hostname and resolver files.
    GuestNetwork,
    /// Identity markers for status checks.
    Identity,
    /// The init environment is assembled.
    Environment,
    /// The old root is detached.
    OldRoot,
    /// stdio is attached to `/dev/console`.
    Console,
    /// The init is executed.
    Exec,
}

impl BootStage {
    /// Stable stage name used in logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Detach => "detach",
            Self::Unshare => "unshare",
            Self::Fork => "fork",
            Self::PrivateRoot => "private-root",
            Self::Seed => "seed",
            Self::Devices => "devices",
            Self::Proc => "proc",
            Self::Sys => "sys",
            Self::Run => "run",
            Self::Marker => "marker",
            Self::BindMounts => "bind-mounts",
            Self::HostNetwork => "host-network",
            Self::Cgroups => "cgroups",
            Self::SwitchRoot => "switch-root",
            Self::Devpts => "devpts",
            Self::Terminals => "terminals",
            Self::GuestNetwork => "guest-network",
            Self::Identity => "identity",
            Self::Environment => "environment",
            Self::OldRoot => "old-root",
            Self::Console => "console",
            Self::Exec => "exec",
        }
    }
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn run_stage<T>(stage: BootStage, f: impl FnOnce() -> Result<T>) -> Result<T> {
    tracing::debug!(stage = stage.name(), "boot stage");
    f().map_err(|e| match e {
        ChamberError::Boot { .. } => e,
        other => ChamberError::Boot {
            stage: stage.name(),
            message: other.to_string(),
        },
    })
}

fn soft_stage(stage: BootStage, f: impl FnOnce() -> Result<()>) {
    tracing::debug!(stage = stage.name(), "boot stage");
    if let Err(e) = f() {
        tracing::warn!(stage = stage.name(), error = %e, "best-effort stage failed, continuing");
    }
}

/// Mount decisions that depend on hardware passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPlan {
    /// How `/dev` is provided.
    pub dev: DevMode,
    /// How `/sys` is exposed.
    pub sys: SysfsMode,
}

impl BootPlan {
    /// Plan for the given passthrough setting.
    #[must_use]
    pub const fn new(hw_access: bool) -> Self {
        if hw_access {
            Self {
                dev: DevMode::Passthrough,
                sys: SysfsMode::Writable,
            }
        } else {
            Self {
                dev: DevMode::Static,
                sys: SysfsMode::ReadOnly,
            }
        }
    }
}

/// Everything the launcher and guest PID 1 need.
#[derive(Debug)]
pub struct BootContext<'a> {
    /// Validated container description.
    pub config: &'a ContainerConfig,
    /// Host path of the root (a directory or an image mount point).
    pub root: PathBuf,
    /// Marker token of this start attempt.
    pub token: &'a MarkerToken,
    /// PTY slaves to bind over the guest's terminals.
    pub slaves: SlavePaths,
    /// Host proc root.
    pub proc_root: PathBuf,
    /// Optional network hook.
    pub network_hook: Option<PathBuf>,
    /// Scratch directory for volatile mode.
    pub volatile_scratch: Option<PathBuf>,
}

/// Forks the launcher and returns its PID.
///
/// Must be called while the runtime is single-threaded.
///
/// # Errors
///
/// Returns an error if the fork fails. Boot failures surface later as the
/// launcher's exit status.
pub fn spawn_launcher(ctx: &BootContext<'_>) -> Result<Pid> {
    // SAFETY: the runtime is single-threaded here, and the child only runs
    // the boot sequence before exiting.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!(launcher = %child, name = %ctx.config.name, "launcher forked");
            Ok(child)
        }
        Ok(ForkResult::Child) => std::process::exit(launcher_main(ctx)),
        Err(e) => Err(ChamberError::Boot {
            stage: BootStage::Fork.name(),
            message: format!("fork launcher: {e}"),
        }),
    }
}

fn launcher_main(ctx: &BootContext<'_>) -> i32 {
    let prepared = run_stage(BootStage::Detach, || {
        setsid().map(drop).map_err(|e| ChamberError::PermissionDenied {
            message: format!("setsid: {e}"),
        })
    })
    .and_then(|()| run_stage(BootStage::Unshare, create_container_namespaces));
    if let Err(e) = prepared {
        tracing::error!(error = %e, "launcher setup failed");
        return 1;
    }

    // SAFETY: the launcher is single-threaded; the child either execs the
    // guest init or exits.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            match guest_init(ctx) {
                Ok(never) => match never {},
                Err(e) => tracing::error!(error = %e, "guest boot failed"),
            }
            std::process::exit(1)
        }
        Ok(ForkResult::Parent { child }) => wait_exit_code(child).unwrap_or_else(|e| {
            tracing::error!(error = %e, "lost track of guest init");
            1
        }),
        Err(e) => {
            tracing::error!(error = %e, "fork into pid namespace failed");
            1
        }
    }
}

/// Runs as PID 1 of the new namespace. Only returns on failure.
fn guest_init(ctx: &BootContext<'_>) -> Result<Infallible> {
    let config = ctx.config;
    let plan = BootPlan::new(config.features.hw_access);

    let root = run_stage(BootStage::PrivateRoot, || {
        make_root_private()?;
        prepare_root(ctx)
    })?;
    run_stage(BootStage::Seed, || {
        chdir(&root).map_err(|e| ChamberError::Mount {
            target: root.clone(),
            message: format!("chdir: {e}"),
        })?;
        consume_seed(&root, ctx.token)
    })?;
    run_stage(BootStage::Devices, || populate_dev(&root, plan.dev))?;
    run_stage(BootStage::Proc, || mount_proc(&root))?;
    run_stage(BootStage::Sys, || mount_sys(&root, plan.sys))?;
    run_stage(BootStage::Run, || mount_run(&root))?;
    run_stage(BootStage::Marker, || {
        let marker = root.join(ctx.token.run_relative());
        std::fs::write(&marker, b"").map_err(|e| ChamberError::io(marker, e))
    })?;
    run_stage(BootStage::BindMounts, || apply_binds(&root, &config.binds))?;

    soft_stage(BootStage::HostNetwork, || {
        network::prepare_host(config, &ctx.proc_root, ctx.network_hook.as_deref(), &root);
        Ok(())
    });
    soft_stage(BootStage::Cgroups, || {
        chamber_core::cgroup::mount_placeholder(&root, &ctx.proc_root).map(drop)
    });

    let switch = run_stage(BootStage::SwitchRoot, || switch_root(&root))?;
    run_stage(BootStage::Devpts, mount_devpts)?;
    run_stage(BootStage::Terminals, || bind_terminals(&ctx.slaves))?;
    soft_stage(BootStage::GuestNetwork, || {
        network::configure_guest(Path::new("/"), config);
        Ok(())
    });
    run_stage(BootStage::Identity, || write_identity(Path::new("/"), config.name.as_str()))?;
    let env = run_stage(BootStage::Environment, || {
        let term = std::env::var("TERM").unwrap_or_else(|_| "linux".into());
        to_cstrings(&guest_environment(config.tty_count, &term))
    })?;
    run_stage(BootStage::OldRoot, || detach_old_root(switch))?;
    run_stage(BootStage::Console, attach_console)?;
    run_stage(BootStage::Exec, || exec_init(&env))
}

fn prepare_root(ctx: &BootContext<'_>) -> Result<PathBuf> {
    if let Some(scratch) = &ctx.volatile_scratch {
        return volatile_root(&ctx.root, scratch);
    }
    if !ctx.config.rootfs.is_image() {
        bind_mount(&ctx.root, &ctx.root)?;
    }
    Ok(ctx.root.clone())
}

fn consume_seed(root: &Path, token: &MarkerToken) -> Result<()> {
    let seed = token.seed_path(root);
    let text = std::fs::read_to_string(&seed).map_err(|e| ChamberError::io(&seed, e))?;
    if MarkerToken::parse(&text)? != *token {
        return Err(ChamberError::Config {
            message: format!("seed {} holds a different token", seed.display()),
        });
    }
    std::fs::remove_file(&seed).map_err(|e| ChamberError::io(&seed, e))
}

/// Location of a bind target inside `root`.
#[must_use]
pub fn bind_target(root: &Path, target: &Path) -> PathBuf {
    root.join(target.strip_prefix("/").unwrap_or(target))
}

fn apply_binds(root: &Path, binds: &[BindMount]) -> Result<()> {
    for bind in binds {
        if !bind.source.exists() {
            tracing::warn!(source = %bind.source.display(), "bind source missing, skipping");
            continue;
        }
        let target = bind_target(root, &bind.target);
        if bind.source.is_dir() {
            ensure_dir(&target)?;
        } else {
            ensure_file(&target)?;
        }
        bind_mount(&bind.source, &target)?;
    }
    Ok(())
}

fn mount_devpts() -> Result<()> {
    let pts = Path::new("/dev/pts");
    ensure_dir(pts)?;
    mount_fs(
        "devpts",
        pts,
        "devpts",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some(DEVPTS_OPTIONS),
    )?;
    let ptmx = Path::new("/dev/ptmx");
    ensure_file(ptmx)?;
    bind_mount(&pts.join("ptmx"), ptmx)
}

fn bind_terminals(slaves: &SlavePaths) -> Result<()> {
    let old_root = old_root_path();
    let via_old_root = |slave: &Path| bind_target(&old_root, slave);

    let console = Path::new("/dev/console");
    ensure_file(console)?;
    bind_mount(&via_old_root(&slaves.console), console)?;
    for (index, slave) in slaves.ttys.iter().enumerate() {
        let tty = PathBuf::from(format!("/dev/tty{}", index + 1));
        ensure_file(&tty)?;
        bind_mount(&via_old_root(slave), &tty)?;
    }
    Ok(())
}

/// Writes the identity and name markers under `root`.
///
/// # Errors
///
/// Returns an error if either file cannot be written.
pub fn write_identity(root: &Path, name: &str) -> Result<()> {
    for (relative, contents) in [(CONTAINER_MARKER, IDENTITY), (NAME_MARKER, name)] {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        std::fs::write(&path, format!("{contents}\n")).map_err(|e| ChamberError::io(&path, e))?;
    }
    Ok(())
}

/// Minimal environment handed to the guest init.
#[must_use]
pub fn guest_environment(tty_count: u8, term: &str) -> Vec<(String, String)> {
    let ttys = (1..=tty_count)
        .map(|n| format!("/dev/tty{n}"))
        .collect::<Vec<_>>()
        .join(" ");
    vec![
        ("PATH".into(), GUEST_PATH.into()),
        ("TERM".into(), term.into()),
        ("HOME".into(), "/root".into()),
        ("container".into(), IDENTITY.into()),
        ("container_ttys".into(), ttys),
    ]
}

/// Converts `KEY=value` pairs for `execve`.
///
/// # Errors
///
/// Returns an error if a key or value contains a NUL byte.
pub fn to_cstrings(env: &[(String, String)]) -> Result<Vec<CString>> {
    env.iter()
        .map(|(k, v)| {
            CString::new(format!("{k}={v}")).map_err(|_| ChamberError::Config {
                message: format!("environment variable {k} contains NUL"),
            })
        })
        .collect()
}

fn attach_console() -> Result<()> {
    let path = Path::new("/dev/console");
    let console = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| ChamberError::io(path, e))?;
    for fd in 0..=2 {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(console.as_raw_fd(), fd) } < 0 {
            return Err(ChamberError::io(path, std::io::Error::last_os_error()));
        }
    }
    drop(console);
    setsid().map_err(|e| ChamberError::PermissionDenied {
        message: format!("setsid: {e}"),
    })?;
    // SAFETY: fd 0 is the console opened above; TIOCSCTTY takes an int arg.
    if unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 0) } < 0 {
        return Err(ChamberError::PermissionDenied {
            message: format!("TIOCSCTTY: {}", std::io::Error::last_os_error()),
        });
    }
    Ok(())
}

/// First init candidate that exists under `root`.
#[must_use]
pub fn find_init(root: &Path) -> Option<&'static str> {
    INIT_CANDIDATES
        .iter()
        .copied()
        .find(|candidate| bind_target(root, Path::new(candidate)).exists())
}

fn exec_init(env: &[CString]) -> Result<Infallible> {
    let init = find_init(Path::new("/")).ok_or_else(|| ChamberError::NotFound {
        kind: "init",
        id: INIT_CANDIDATES.join(", "),
    })?;
    let path = CString::new(Path::new(init).as_os_str().as_bytes()).map_err(|_| ChamberError::Config {
        message: format!("init path {init} contains NUL"),
    })?;
    tracing::info!(init, "executing guest init");
    execve(&path, &[path.as_c_str()], env).map_err(|e| ChamberError::PermissionDenied {
        message: format!("execve {init}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_changes_only_dev_and_sys() {
        let normal = BootPlan::new(false);
        let hw = BootPlan::new(true);
        assert_eq!(normal.dev, DevMode::Static);
        assert_eq!(normal.sys, SysfsMode::ReadOnly);
        assert_eq!(hw.dev, DevMode::Passthrough);
        assert_eq!(hw.sys, SysfsMode::Writable);
    }

    #[test]
    fn stage_names_are_unique() {
        let stages = [
            BootStage::Detach,
            BootStage::Unshare,
            BootStage::Fork,
            BootStage::PrivateRoot,
            BootStage::Seed,
            BootStage::Devices,
            BootStage::Proc,
            BootStage::Sys,
            BootStage::Run,
            BootStage::Marker,
            BootStage::BindMounts,
            BootStage::HostNetwork,
            BootStage::Cgroups,
            BootStage::SwitchRoot,
            BootStage::Devpts,
            BootStage::Terminals,
            BootStage::GuestNetwork,
            BootStage::Identity,
            BootStage::Environment,
            BootStage::OldRoot,
            BootStage::Console,
            BootStage::Exec,
        ];
        let mut names: Vec<_> = stages.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), stages.len());
    }

    #[test]
    fn stage_errors_name_the_stage() {
        let err = run_stage::<()>(BootStage::Sys, || {
            Err(ChamberError::Config {
                message: "boom".into(),
            })
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "boot stage sys failed: invalid configuration: boom");
    }

    #[test]
    fn environment_lists_terminals() {
        let env = guest_environment(3, "xterm-256color");
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("container"), Some("chamber"));
        assert_eq!(get("HOME"), Some("/root"));
        assert_eq!(get("TERM"), Some("xterm-256color"));
        assert_eq!(get("container_ttys"), Some("/dev/tty1 /dev/tty2 /dev/tty3"));
        assert_eq!(get("PATH"), Some(GUEST_PATH));
    }

    #[test]
    fn environment_rejects_nul() {
        assert!(to_cstrings(&[("A".into(), "b\0c".into())]).is_err());
        let ok = to_cstrings(&[("A".into(), "b".into())]).expect("valid");
        assert_eq!(ok[0].as_bytes(), b"A=b");
    }

    #[test]
    fn bind_targets_stay_inside_root() {
        assert_eq!(
            bind_target(Path::new("/srv/deb"), Path::new("/mnt/data")),
            PathBuf::from("/srv/deb/mnt/data")
        );
        assert_eq!(
            bind_target(Path::new("/.old_root"), Path::new("/dev/pts/4")),
            PathBuf::from("/.old_root/dev/pts/4")
        );
    }

    #[test]
    fn identity_markers_are_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_identity(dir.path(), "debian").expect("write");
        let identity = std::fs::read_to_string(dir.path().join(CONTAINER_MARKER)).expect("identity");
        let name = std::fs::read_to_string(dir.path().join(NAME_MARKER)).expect("name");
        assert_eq!(identity.trim(), IDENTITY);
        assert_eq!(name.trim(), "debian");
    }

    #[test]
    fn seed_must_match_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = MarkerToken::generate();
        let other = MarkerToken::generate();
        std::fs::write(token.seed_path(dir.path()), other.as_str()).expect("seed");
        assert!(consume_seed(dir.path(), &token).is_err());

        std::fs::write(token.seed_path(dir.path()), token.as_str()).expect("seed");
        consume_seed(dir.path(), &token).expect("matching seed");
        assert!(!token.seed_path(dir.path()).exists());
    }

    #[test]
    fn init_candidates_are_tried_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(find_init(dir.path()), None);
        std::fs::create_dir_all(dir.path().join("usr/lib/systemd")).expect("mkdir");
        std::fs::write(dir.path().join("usr/lib/systemd/systemd"), b"").expect("systemd");
        assert_eq!(find_init(dir.path()), Some("/usr/lib/systemd/systemd"));
        std::fs::create_dir_all(dir.path().join("sbin")).expect("mkdir");
        std::fs::write(dir.path().join("sbin/init"), b"").expect("init");
        assert_eq!(find_init(dir.path()), Some("/sbin/init"));
    }
}
