//! Linux namespace management for container isolation.
//!
//! Containers get fresh mount, UTS, IPC and PID namespaces. The network
//! namespace is shared with the host on purpose, and user namespaces are
//! never created: many target kernels lack them and the runtime already
//! requires root.

pub mod ipc;
pub mod mount;
pub mod pid;
pub mod uts;

use std::fs::File;
use std::path::Path;

use chamber_common::error::{ChamberError, Result};
use nix::sched::{CloneFlags, setns, unshare};

/// Namespaces a container owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    /// Mount table.
    Mount,
    /// Hostname and domain name.
    Uts,
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Process IDs.
    Pid,
}

impl NamespaceKind {
    /// Every kind, in the order `enter` joins them.
    pub const ALL: [Self; 4] = [Self::Mount, Self::Uts, Self::Ipc, Self::Pid];

    /// File name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Pid => "pid",
        }
    }

    /// Matching `clone(2)` flag.
    #[must_use]
    pub const fn clone_flag(self) -> CloneFlags {
        match self {
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Pid => CloneFlags::CLONE_NEWPID,
        }
    }
}

/// Flags for the single `unshare(2)` call that isolates a container.
#[must_use]
pub fn container_clone_flags() -> CloneFlags {
    NamespaceKind::ALL
        .iter()
        .fold(CloneFlags::empty(), |acc, kind| acc | kind.clone_flag())
}

/// Creates mount, UTS, IPC and PID namespaces in one request.
///
/// The calling process keeps its PID; only children forked afterwards land
/// in the new PID namespace, the first of them as PID 1.
///
/// # Errors
///
/// Returns an error if the kernel refuses `unshare(2)`.
pub fn create_container_namespaces() -> Result<()> {
    let flags = container_clone_flags();
    unshare(flags).map_err(|e| ChamberError::PermissionDenied {
        message: format!("namespace creation failed ({flags:?}): {e}"),
    })?;
    tracing::debug!(?flags, "container namespaces created");
    Ok(())
}

/// Read-only handles to the namespaces of a running process.
///
/// The handles are closed when the set is dropped.
#[derive(Debug)]
pub struct NamespaceHandles {
    pid: i32,
    handles: Vec<(NamespaceKind, File)>,
}

impl NamespaceHandles {
    /// Opens `/proc/<pid>/ns/{mnt,uts,ipc,pid}` under `proc_root`.
    ///
    /// A missing mount namespace handle is an error; the other kinds are
    /// skipped with a warning so a partially supported kernel still works.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount namespace handle cannot be opened.
    pub fn open(proc_root: &Path, pid: i32) -> Result<Self> {
        let ns_dir = proc_root.join(pid.to_string()).join("ns");
        let mut handles = Vec::with_capacity(NamespaceKind::ALL.len());
        for kind in NamespaceKind::ALL {
            let path = ns_dir.join(kind.proc_name());
            match File::open(&path) {
                Ok(file) => handles.push((kind, file)),
                Err(e) if kind == NamespaceKind::Mount => return Err(ChamberError::io(path, e)),
                Err(e) => {
                    tracing::warn!(pid, ns = kind.proc_name(), error = %e, "namespace handle unavailable");
                }
            }
        }
        Ok(Self { pid, handles })
    }

    /// PID the handles were opened for.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Whether a handle of this kind was opened.
    #[must_use]
    pub fn has(&self, kind: NamespaceKind) -> bool {
        self.handles.iter().any(|(k, _)| *k == kind)
    }

    /// Joins every opened namespace.
    ///
    /// Joining the mount namespace is mandatory; UTS, IPC and PID are
    /// best-effort. Returns the kinds that could not be joined.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount namespace cannot be joined.
    pub fn join_all(self) -> Result<Vec<NamespaceKind>> {
        let mut skipped: Vec<NamespaceKind> = NamespaceKind::ALL
            .into_iter()
            .filter(|k| !self.has(*k))
            .collect();
        for (kind, file) in &self.handles {
            match join(*kind, file) {
                Ok(()) => {}
                Err(e) if *kind == NamespaceKind::Mount => return Err(e),
                Err(e) => {
                    tracing::warn!(pid = self.pid, ns = kind.proc_name(), error = %e, "joining namespace failed, continuing");
                    skipped.push(*kind);
                }
            }
        }
        Ok(skipped)
    }
}

/// Joins one namespace through an open handle.
///
/// # Errors
///
/// Returns an error if `setns(2)` fails.
pub fn join(kind: NamespaceKind, handle: &File) -> Result<()> {
    setns(handle, kind.clone_flag()).map_err(|e| ChamberError::PermissionDenied {
        message: format!("setns {} failed: {e}", kind.proc_name()),
    })?;
    tracing::debug!(ns = kind.proc_name(), "joined namespace");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_flags_exclude_network_and_user() {
        let flags = container_clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn open_requires_mount_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ns = dir.path().join("42").join("ns");
        std::fs::create_dir_all(&ns).expect("mkdir");
        assert!(NamespaceHandles::open(dir.path(), 42).is_err());

        std::fs::write(ns.join("mnt"), b"").expect("mnt");
        std::fs::write(ns.join("uts"), b"").expect("uts");
        let handles = NamespaceHandles::open(dir.path(), 42).expect("open");
        assert_eq!(handles.pid(), 42);
        assert!(handles.has(NamespaceKind::Mount));
        assert!(handles.has(NamespaceKind::Uts));
        assert!(!handles.has(NamespaceKind::Pid));
    }

    #[test]
    fn open_real_self_namespaces() {
        let handles = NamespaceHandles::open(Path::new("/proc"), i32::try_from(std::process::id()).expect("pid fits"))
            .expect("own namespaces are readable");
        assert!(handles.has(NamespaceKind::Mount));
    }
}
