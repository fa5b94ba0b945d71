//! Namespace joining for executing commands in running containers.
//!
//! The calling process never calls `setns` itself. A helper is forked
//! that joins the guest's namespaces and root, then forks once more so the
//! command is born inside the guest's PID namespace. The helper ignores
//! `SIGINT` and relays the command's exit status.

use std::ffi::{CString, OsString};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use chamber_common::constants::{GUEST_PATH, IDENTITY, SHELL_CANDIDATES};
use chamber_common::error::{ChamberError, Result};
use chamber_core::namespace::NamespaceHandles;
use chamber_core::procfs;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{ForkResult, Pid, chdir, chroot, execve, fork};

use crate::bootstrap::{bind_target, to_cstrings};
use crate::process::wait_exit_code;

/// Exit status when the command does not exist in the guest.
const NOT_FOUND_STATUS: i32 = 127;

/// Exit status when the command exists but cannot be executed.
const NOT_EXECUTABLE_STATUS: i32 = 126;

/// What to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecTarget {
    /// Interactive login shell, optionally as another user.
    Shell {
        /// Target user; `None` or `root` selects root's shell.
        user: Option<String>,
    },
    /// Explicit argv.
    Command(Vec<String>),
}

impl ExecTarget {
    /// Resolves the target to an argv, inspecting the guest root at
    /// `guest_root` (as seen from the caller).
    ///
    /// # Errors
    ///
    /// Returns an error if the command is empty, the user name is invalid,
    /// or no shell exists in the guest.
    pub fn argv(&self, guest_root: &Path) -> Result<Vec<String>> {
        match self {
            Self::Command(argv) if argv.is_empty() => Err(ChamberError::Config {
                message: "command is empty".into(),
            }),
            Self::Command(argv) => Ok(argv.clone()),
            Self::Shell { user } => match user.as_deref().filter(|u| *u != "root") {
                None => {
                    let shell = find_shell(guest_root).ok_or_else(|| ChamberError::NotFound {
                        kind: "shell",
                        id: SHELL_CANDIDATES.join(", "),
                    })?;
                    Ok(vec![shell.to_string(), "-l".into()])
                }
                Some(user) if user.is_empty() || user.starts_with('-') || user.contains(char::is_whitespace) => {
                    Err(ChamberError::Config {
                        message: format!("invalid user name: {user:?}"),
                    })
                }
                Some(user) => Ok(vec!["su".into(), "-l".into(), user.to_string()]),
            },
        }
    }
}

/// Symlinks followed before a guest path is considered unresolvable.
const MAX_SYMLINK_HOPS: usize = 40;

/// Resolves `path` as the guest would see it, with `root` as `/`, and
/// returns the host path of the final target.
///
/// Absolute symlinks and `..` are confined to `root`, so a guest link such
/// as `/bin/sh -> /bin/busybox` resolves inside the guest even when `root`
/// is reached through `/proc/<pid>/root`.
#[must_use]
pub fn resolve_in_root(root: &Path, path: &Path) -> Option<PathBuf> {
    let mut pending = Vec::new();
    push_components(&mut pending, path);
    let mut resolved = PathBuf::from("/");
    let mut hops = 0;
    while let Some(part) = pending.pop() {
        if part == ".." {
            let _ = resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let host = bind_target(root, &candidate);
        let meta = host.symlink_metadata().ok()?;
        if !meta.file_type().is_symlink() {
            resolved = candidate;
            continue;
        }
        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return None;
        }
        let link = std::fs::read_link(&host).ok()?;
        if link.is_absolute() {
            resolved = PathBuf::from("/");
        }
        push_components(&mut pending, &link);
    }
    Some(bind_target(root, &resolved))
}

/// Pushes the components of `path` so the first one is popped first.
fn push_components(stack: &mut Vec<OsString>, path: &Path) {
    for component in path.components().rev() {
        match component {
            Component::Normal(part) => stack.push(part.to_os_string()),
            Component::ParentDir => stack.push(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
}

/// Whether the guest path `path` names an executable regular file.
#[must_use]
pub fn is_executable(root: &Path, path: &Path) -> bool {
    resolve_in_root(root, path)
        .and_then(|host| std::fs::metadata(host).ok())
        .is_some_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

/// First executable shell from the candidate list under `root`.
#[must_use]
pub fn find_shell(root: &Path) -> Option<&'static str> {
    SHELL_CANDIDATES
        .iter()
        .copied()
        .find(|shell| is_executable(root, Path::new(shell)))
}

/// Resolves `program` against a colon-separated `path_list`, looking in
/// `root`. Names containing `/` are taken as-is. Returns the path as seen
/// inside `root`.
#[must_use]
pub fn resolve_program(program: &str, path_list: &str, root: &Path) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return resolve_in_root(root, &path).is_some().then_some(path);
    }
    path_list
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| is_executable(root, candidate))
}

/// Environment of a command started inside the guest.
#[must_use]
pub fn guest_env(term: &str) -> Vec<(String, String)> {
    vec![
        ("PATH".into(), GUEST_PATH.into()),
        ("TERM".into(), term.into()),
        ("HOME".into(), "/root".into()),
        ("container".into(), IDENTITY.into()),
    ]
}

/// Forks a helper that runs `argv` inside the namespaces of `pid` and
/// returns the helper's PID. The helper exits with the command's status.
///
/// # Errors
///
/// Returns an error if `argv` is empty, the guest's mount namespace or
/// root cannot be opened, or the fork fails.
pub fn spawn_in_guest(proc_root: &Path, pid: i32, argv: &[String]) -> Result<Pid> {
    let Some(program) = argv.first() else {
        return Err(ChamberError::Config {
            message: "command is empty".into(),
        });
    };
    let handles = NamespaceHandles::open(proc_root, pid)?;
    let root_path = procfs::pid_dir(proc_root, pid).join("root");
    let guest_root = File::open(&root_path).map_err(|e| ChamberError::io(&root_path, e))?;
    let args = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| ChamberError::Config {
            message: "command contains a NUL byte".into(),
        })?;
    let term = std::env::var("TERM").unwrap_or_else(|_| "linux".into());
    let env = to_cstrings(&guest_env(&term))?;

    tracing::debug!(pid, ?argv, "spawning guest command");
    // SAFETY: the child only joins namespaces, forks and execs or exits.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => std::process::exit(helper_main(handles, &guest_root, program, &args, &env)),
        Err(e) => Err(ChamberError::PermissionDenied {
            message: format!("fork exec helper: {e}"),
        }),
    }
}

fn enter_root(guest_root: &File) -> Result<()> {
    let denied = |step: &str, e: &dyn std::fmt::Display| ChamberError::PermissionDenied {
        message: format!("{step}: {e}"),
    };
    // SAFETY: the descriptor is a valid open directory.
    if unsafe { libc::fchdir(guest_root.as_raw_fd()) } != 0 {
        return Err(denied("fchdir", &std::io::Error::last_os_error()));
    }
    chroot(".").map_err(|e| denied("chroot", &e))?;
    chdir("/").map_err(|e| denied("chdir", &e))
}

fn helper_main(handles: NamespaceHandles, guest_root: &File, program: &str, args: &[CString], env: &[CString]) -> i32 {
    let entered = handles.join_all().and_then(|skipped| {
        if !skipped.is_empty() {
            tracing::debug!(?skipped, "some namespaces were not joined");
        }
        enter_root(guest_root)
    });
    if let Err(e) = entered {
        tracing::error!(error = %e, "entering container failed");
        return 1;
    }

    // SAFETY: replacing the SIGINT disposition has no preconditions here.
    if let Err(e) = unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) } {
        tracing::debug!(error = %e, "SIGINT not ignored");
    }
    // SAFETY: the helper is single-threaded; the child execs or exits.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // SAFETY: as above.
            let _ = unsafe { signal(Signal::SIGINT, SigHandler::SigDfl) };
            std::process::exit(exec_program(program, args, env))
        }
        Ok(ForkResult::Parent { child }) => wait_exit_code(child).unwrap_or(1),
        Err(e) => {
            tracing::error!(error = %e, "fork inside container failed");
            1
        }
    }
}

fn exec_program(program: &str, args: &[CString], env: &[CString]) -> i32 {
    let Some(path) = resolve_program(program, GUEST_PATH, Path::new("/")) else {
        tracing::error!(program, "command not found in container");
        return NOT_FOUND_STATUS;
    };
    let Ok(path) = CString::new(path.as_os_str().as_bytes()) else {
        return NOT_FOUND_STATUS;
    };
    match execve(&path, args, env) {
        Ok(never) => match never {},
        Err(e) => {
            tracing::error!(program, error = %e, "execve failed");
            NOT_EXECUTABLE_STATUS
        }
    }
}

/// Runs `target` inside the container whose init is `pid`, wiring it to
/// the caller's terminal, and returns its exit status.
///
/// # Errors
///
/// Returns an error if the target cannot be resolved or the helper cannot
/// be started.
pub fn run_in_guest(proc_root: &Path, pid: i32, target: &ExecTarget) -> Result<i32> {
    let argv = target.argv(&procfs::pid_dir(proc_root, pid).join("root"))?;
    let helper = spawn_in_guest(proc_root, pid, &argv)?;
    // Ctrl-C belongs to the guest command; the caller just keeps waiting.
    if let Err(e) = ctrlc::set_handler(|| {}) {
        tracing::debug!(error = %e, "interrupt handler not installed");
    }
    let code = wait_exit_code(helper)?;
    tracing::info!(pid, code, "guest command finished");
    Ok(code)
}
