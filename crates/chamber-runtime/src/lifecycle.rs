//! Record validation, stop and inspection of containers.
//!
//! A record is only trusted while its PID is alive and the process's root
//! carries the identity marker (and, if present, the matching name marker).
//! Anything else is stale and is purged on sight.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chamber_common::config::RuntimeSettings;
use chamber_common::constants::{CONTAINER_MARKER, IDENTITY, NAME_MARKER};
use chamber_common::error::{ChamberError, Result};
use chamber_common::types::{ContainerName, ContainerState, Health};
use chamber_core::filesystem::devices::restore_host_nodes;
use chamber_core::filesystem::image::unmount_image;
use chamber_core::namespace::pid::is_namespace_init;
use chamber_core::procfs;
use chrono::Utc;

use crate::logs;
use crate::process::{GuestControl, HostProcesses, StopOutcome, escalate_stop};
use crate::shutdown::{self, DefaultShutdownPolicy, InitSystem, ShutdownPolicy};
use crate::state::{ContainerRecord, RecordStore};

/// Result of a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    /// No valid record.
    Absent,
    /// Validated and running.
    Running {
        /// The record.
        record: ContainerRecord,
        /// Terminal holder health.
        health: Health,
    },
}

/// Detailed view of a running container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// The record.
    pub record: ContainerRecord,
    /// Detected init system.
    pub init: InitSystem,
    /// Terminal holder health.
    pub health: Health,
    /// Console log of background containers.
    pub log_path: PathBuf,
}

/// What a stop request found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReport {
    /// There was no record.
    NotRunning,
    /// The record was stale and has been purged.
    Stale,
    /// The guest was stopped.
    Stopped(StopOutcome),
}

/// Scratch directory of a volatile container.
#[must_use]
pub fn volatile_dir(settings: &RuntimeSettings, name: &ContainerName) -> PathBuf {
    settings.data_dir.join("volatile").join(name.sanitized())
}

fn marker_text(proc_root: &Path, pid: i32, marker: &str) -> Option<String> {
    std::fs::read_to_string(procfs::path_in_root(proc_root, pid, Path::new(marker)))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Whether `pid` is a live chamber container, optionally named `name`.
pub fn carries_identity(proc_root: &Path, ctl: &dyn GuestControl, pid: i32, name: Option<&ContainerName>) -> bool {
    if !ctl.is_alive(pid) {
        return false;
    }
    if marker_text(proc_root, pid, CONTAINER_MARKER).as_deref() != Some(IDENTITY) {
        return false;
    }
    match (name, marker_text(proc_root, pid, NAME_MARKER)) {
        (Some(expected), Some(found)) => expected.as_str() == found,
        _ => true,
    }
}

/// Container lifecycle over a record store.
pub struct Lifecycle {
    settings: RuntimeSettings,
    store: RecordStore,
    ctl: Box<dyn GuestControl>,
    policy: Box<dyn ShutdownPolicy>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("settings", &self.settings)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// Lifecycle backed by the host process table and the default shutdown
    /// policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the records directory cannot be created.
    pub fn new(settings: RuntimeSettings) -> Result<Self> {
        let ctl = Box::new(HostProcesses::new(settings.proc_root.clone()));
        Self::with_parts(settings, ctl, Box::new(DefaultShutdownPolicy))
    }

    /// Lifecycle with an explicit process controller and shutdown policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the records directory cannot be created.
    pub fn with_parts(
        settings: RuntimeSettings,
        ctl: Box<dyn GuestControl>,
        policy: Box<dyn ShutdownPolicy>,
    ) -> Result<Self> {
        let store = RecordStore::open(settings.records_dir())?;
        Ok(Self {
            settings,
            store,
            ctl,
            policy,
        })
    }

    /// Runtime settings.
    #[must_use]
    pub const fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Record store.
    #[must_use]
    pub const fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Process controller.
    #[must_use]
    pub fn control(&self) -> &dyn GuestControl {
        self.ctl.as_ref()
    }

    /// Whether a record still describes a live container.
    #[must_use]
    pub fn is_valid(&self, record: &ContainerRecord) -> bool {
        carries_identity(&self.settings.proc_root, self.control(), record.pid, Some(&record.name))
    }

    /// Loads the record for `name` if it is valid, purging it otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn live_record(&self, name: &ContainerName) -> Result<Option<ContainerRecord>> {
        let Some(record) = self.store.load(name)? else {
            return Ok(None);
        };
        if self.is_valid(&record) {
            return Ok(Some(record));
        }
        tracing::info!(name = %name, pid = record.pid, "purging stale record");
        self.release(&record, false);
        Ok(None)
    }

    /// Fails with [`ChamberError::AlreadyRunning`] if `name` is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the container runs or the store is unreadable.
    pub fn ensure_absent(&self, name: &ContainerName) -> Result<()> {
        match self.live_record(name)? {
            Some(record) => Err(ChamberError::AlreadyRunning {
                name: name.to_string(),
                pid: record.pid,
            }),
            None => Ok(()),
        }
    }

    /// Health of the terminal plumbing of a running container.
    #[must_use]
    pub fn health(&self, record: &ContainerRecord) -> Health {
        match record.holder_pid {
            Some(holder) if !self.ctl.is_alive(holder) => Health::Unhealthy,
            _ => Health::Healthy,
        }
    }

    /// Releases everything a container held and deletes its record.
    ///
    /// Every step is best-effort.
    pub fn release(&self, record: &ContainerRecord, preserve_mount: bool) {
        if let Some(mount) = record.mount_path.as_deref().filter(|_| !preserve_mount) {
            if let Err(e) = unmount_image(mount) {
                tracing::warn!(mount = %mount.display(), error = %e, "image not unmounted");
            }
        }
        if record.hw_access {
            let restored = restore_host_nodes(Path::new("/dev"));
            if !restored.is_empty() {
                tracing::info!(?restored, "host device nodes restored");
            }
        }
        if let Some(holder) = record.holder_pid.filter(|h| self.ctl.is_alive(*h)) {
            if let Err(e) = self.ctl.signal(holder, libc::SIGTERM) {
                tracing::warn!(holder, error = %e, "holder not terminated");
            }
        }
        let scratch = volatile_dir(&self.settings, &record.name);
        if scratch.exists() {
            if let Err(e) = std::fs::remove_dir_all(&scratch) {
                tracing::warn!(path = %scratch.display(), error = %e, "volatile scratch not removed");
            }
        }
        if let Err(e) = self.store.remove(&record.name) {
            tracing::warn!(name = %record.name, error = %e, "record not removed");
        }
    }

    /// Stops `name`. Absent containers are not an error.
    ///
    /// With `preserve_mount` an image root stays mounted for a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn stop(&self, name: &ContainerName, preserve_mount: bool) -> Result<StopReport> {
        self.stop_via(name, ContainerState::Stopping, preserve_mount)
    }

    /// Stops `name` on the way to a restart, keeping any image mount.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn stop_for_restart(&self, name: &ContainerName) -> Result<StopReport> {
        self.stop_via(name, ContainerState::Restarting, true)
    }

    fn stop_via(&self, name: &ContainerName, via: ContainerState, preserve_mount: bool) -> Result<StopReport> {
        let Some(mut record) = self.store.load(name)? else {
            tracing::info!(name = %name, "not running");
            return Ok(StopReport::NotRunning);
        };
        if !self.is_valid(&record) {
            tracing::info!(name = %name, pid = record.pid, "record was stale, purged");
            self.release(&record, preserve_mount);
            return Ok(StopReport::Stale);
        }

        match record.state.transition(via) {
            Ok(state) => {
                record.state = state;
                self.store.save(&record)?;
            }
            Err(e) => tracing::warn!(name = %name, state = %record.state, error = %e, "resuming an interrupted stop"),
        }

        let init = shutdown::detect(&self.settings.proc_root, record.pid);
        let action = self.policy.graceful_action(init);
        tracing::info!(name = %name, pid = record.pid, %init, ?action, "stopping container");
        let outcome = escalate_stop(self.control(), record.pid, &action, &self.settings.stop);
        self.release(&record, preserve_mount);
        Ok(StopReport::Stopped(outcome))
    }

    /// Stops every container in a comma-separated list, continuing past
    /// failures.
    pub fn stop_many(&self, names: &str) -> Vec<(String, Result<StopReport>)> {
        names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|raw| {
                let result = ContainerName::new(raw).and_then(|name| self.stop(&name, false));
                (raw.to_string(), result)
            })
            .collect()
    }

    /// Status of `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn status(&self, name: &ContainerName) -> Result<ContainerStatus> {
        Ok(match self.live_record(name)? {
            Some(record) => {
                let health = self.health(&record);
                ContainerStatus::Running { record, health }
            }
            None => ContainerStatus::Absent,
        })
    }

    /// Details of a running container.
    ///
    /// # Errors
    ///
    /// Returns [`ChamberError::NotFound`] if it is not running.
    pub fn info(&self, name: &ContainerName) -> Result<ContainerInfo> {
        let record = self
            .live_record(name)?
            .ok_or_else(|| ChamberError::container_not_found(name.as_str()))?;
        Ok(ContainerInfo {
            init: shutdown::detect(&self.settings.proc_root, record.pid),
            health: self.health(&record),
            log_path: logs::log_path(&self.settings.logs_dir(), name),
            record,
        })
    }

    /// Every valid record with its health. Stale records are purged.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn show(&self) -> Result<Vec<(ContainerRecord, Health)>> {
        let mut running = Vec::new();
        for record in self.store.list()? {
            if self.is_valid(&record) {
                let health = self.health(&record);
                running.push((record, health));
            } else {
                tracing::debug!(name = %record.name, "purging stale record");
                self.release(&record, false);
            }
        }
        Ok(running)
    }

    /// Registers running chamber containers that have no record, e.g.
    /// after the data directory was wiped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn scan(&self) -> Result<Vec<ContainerRecord>> {
        let proc_root = &self.settings.proc_root;
        let known: HashSet<i32> = self.show()?.iter().map(|(r, _)| r.pid).collect();
        let mut registered = Vec::new();
        let mut pids = procfs::list_pids(proc_root);
        pids.sort_unstable();
        for pid in pids {
            if known.contains(&pid) || !is_namespace_init(proc_root, pid) {
                continue;
            }
            if !carries_identity(proc_root, self.control(), pid, None) {
                continue;
            }
            let Some(name) = marker_text(proc_root, pid, NAME_MARKER).and_then(|n| ContainerName::new(n).ok())
            else {
                continue;
            };
            if self.store.load(&name)?.is_some() || registered.iter().any(|r: &ContainerRecord| r.name == name) {
                tracing::debug!(name = %name, pid, "name already taken, not registering");
                continue;
            }
            let record = ContainerRecord {
                rootfs: std::fs::read_link(procfs::pid_dir(proc_root, pid).join("root")).unwrap_or_default(),
                name,
                pid,
                mount_path: None,
                hw_access: false,
                holder_pid: None,
                started_at: Utc::now(),
                state: ContainerState::Running,
            };
            self.store.save(&record)?;
            tracing::info!(name = %record.name, pid, "registered running container");
            registered.push(record);
        }
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use chamber_common::config::StopTimeouts;

    use super::*;

    #[derive(Default)]
    struct Table {
        alive: HashSet<i32>,
        signals: Vec<(i32, i32)>,
    }

    #[derive(Clone, Default)]
    struct FakeControl(Rc<RefCell<Table>>);

    impl GuestControl for FakeControl {
        fn is_alive(&self, pid: i32) -> bool {
            self.0.borrow().alive.contains(&pid)
        }

        fn signal(&self, pid: i32, signal: i32) -> Result<()> {
            let mut table = self.0.borrow_mut();
            table.signals.push((pid, signal));
            if signal == libc::SIGTERM {
                let _ = table.alive.remove(&pid);
            }
            Ok(())
        }

        fn run_in_guest(&self, _pid: i32, _argv: &[String], _timeout: Duration) -> Result<Option<i32>> {
            Ok(Some(0))
        }
    }

    struct Fixture {
        _data: tempfile::TempDir,
        proc: tempfile::TempDir,
        ctl: FakeControl,
        lifecycle: Lifecycle,
    }

    fn fixture() -> Fixture {
        let data = tempfile::tempdir().expect("data");
        let proc = tempfile::tempdir().expect("proc");
        let mut settings = RuntimeSettings::with_data_dir(data.path());
        settings.proc_root = proc.path().to_path_buf();
        settings.stop = StopTimeouts {
            graceful: Duration::from_millis(20),
            terminate: Duration::from_millis(20),
            kill: Duration::from_millis(20),
            poll: Duration::from_millis(5),
        };
        let ctl = FakeControl::default();
        let lifecycle =
            Lifecycle::with_parts(settings, Box::new(ctl.clone()), Box::new(DefaultShutdownPolicy)).expect("lifecycle");
        Fixture {
            _data: data,
            proc,
            ctl,
            lifecycle,
        }
    }

    fn guest(proc_root: &Path, pid: i32, identity: &str, name: Option<&str>) {
        let root = proc_root.join(pid.to_string()).join("root");
        std::fs::create_dir_all(root.join("run/systemd")).expect("mkdir");
        std::fs::write(root.join(CONTAINER_MARKER), format!("{identity}\n")).expect("identity");
        if let Some(name) = name {
            std::fs::create_dir_all(root.join("run/chamber")).expect("mkdir");
            std::fs::write(root.join(NAME_MARKER), format!("{name}\n")).expect("name");
        }
        std::fs::write(
            proc_root.join(pid.to_string()).join("status"),
            format!("Name:\tinit\nNSpid:\t{pid}\t1\n"),
        )
        .expect("status");
    }

    fn record(name: &str, pid: i32) -> ContainerRecord {
        ContainerRecord {
            name: ContainerName::new(name).expect("name"),
            pid,
            rootfs: PathBuf::from("/srv/rootfs"),
            mount_path: None,
            hw_access: false,
            holder_pid: None,
            started_at: Utc::now(),
            state: ContainerState::Running,
        }
    }

    #[test]
    fn identity_must_match_exactly() {
        let f = fixture();
        let _ = f.ctl.0.borrow_mut().alive.insert(10);
        let _ = f.ctl.0.borrow_mut().alive.insert(11);
        guest(f.proc.path(), 10, "chamber", Some("a"));
        guest(f.proc.path(), 11, "docker", Some("b"));
        let a = ContainerName::new("a").expect("name");
        assert!(carries_identity(f.proc.path(), &f.ctl, 10, Some(&a)));
        assert!(!carries_identity(f.proc.path(), &f.ctl, 11, None));
        let other = ContainerName::new("other").expect("name");
        assert!(!carries_identity(f.proc.path(), &f.ctl, 10, Some(&other)));
    }

    #[test]
    fn dead_pid_record_is_purged_on_status() {
        let f = fixture();
        let rec = record("gone", 300);
        f.lifecycle.store().save(&rec).expect("save");
        assert_eq!(f.lifecycle.status(&rec.name).expect("status"), ContainerStatus::Absent);
        assert!(f.lifecycle.store().load(&rec.name).expect("load").is_none());
    }

    #[test]
    fn holder_death_makes_running_container_unhealthy() {
        let f = fixture();
        let _ = f.ctl.0.borrow_mut().alive.insert(20);
        guest(f.proc.path(), 20, "chamber", Some("web"));
        let mut rec = record("web", 20);
        rec.holder_pid = Some(21);
        f.lifecycle.store().save(&rec).expect("save");

        let health = match f.lifecycle.status(&rec.name).expect("status") {
            ContainerStatus::Running { health, .. } => Some(health),
            ContainerStatus::Absent => None,
        };
        assert_eq!(health, Some(Health::Unhealthy));

        let _ = f.ctl.0.borrow_mut().alive.insert(21);
        assert_eq!(f.lifecycle.info(&rec.name).expect("info").health, Health::Healthy);
    }

    #[test]
    fn already_running_is_exit_code_two() {
        let f = fixture();
        let _ = f.ctl.0.borrow_mut().alive.insert(30);
        guest(f.proc.path(), 30, "chamber", Some("db"));
        let rec = record("db", 30);
        f.lifecycle.store().save(&rec).expect("save");
        assert_eq!(f.lifecycle.ensure_absent(&rec.name).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn stop_terminates_holder_and_removes_record() {
        let f = fixture();
        {
            let mut table = f.ctl.0.borrow_mut();
            let _ = table.alive.insert(40);
            let _ = table.alive.insert(41);
        }
        guest(f.proc.path(), 40, "chamber", Some("svc"));
        let mut rec = record("svc", 40);
        rec.holder_pid = Some(41);
        f.lifecycle.store().save(&rec).expect("save");

        let report = f.lifecycle.stop(&rec.name, false).expect("stop");
        assert!(matches!(report, StopReport::Stopped(_)));
        assert!(f.lifecycle.store().load(&rec.name).expect("load").is_none());
        assert!(f.ctl.0.borrow().signals.contains(&(41, libc::SIGTERM)));
    }

    #[test]
    fn bulk_stop_reports_each_name() {
        let f = fixture();
        f.lifecycle.store().save(&record("stale", 50)).expect("save");
        let results = f.lifecycle.stop_many("stale, missing ,,bad/name");
        let names: Vec<_> = results.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["stale", "missing", "bad/name"]);
        assert_eq!(*results[0].1.as_ref().expect("stale"), StopReport::Stale);
        assert_eq!(*results[1].1.as_ref().expect("missing"), StopReport::NotRunning);
        assert!(results[2].1.is_err());
    }

    #[test]
    fn scan_registers_unrecorded_guests_once() {
        let f = fixture();
        {
            let mut table = f.ctl.0.borrow_mut();
            for pid in [60, 61, 62] {
                let _ = table.alive.insert(pid);
            }
        }
        guest(f.proc.path(), 60, "chamber", Some("found"));
        guest(f.proc.path(), 61, "chamber", None);
        guest(f.proc.path(), 62, "lxc", Some("foreign"));

        let registered = f.lifecycle.scan().expect("scan");
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].name.as_str(), "found");
        assert_eq!(registered[0].pid, 60);
        assert!(f.lifecycle.scan().expect("rescan").is_empty());
        assert_eq!(f.lifecycle.show().expect("show").len(), 1);
    }

    #[test]
    fn volatile_scratch_is_removed_on_release() {
        let f = fixture();
        let rec = record("tmp", 70);
        let scratch = volatile_dir(f.lifecycle.settings(), &rec.name);
        std::fs::create_dir_all(scratch.join("upper")).expect("scratch");
        f.lifecycle.store().save(&rec).expect("save");
        f.lifecycle.release(&rec, false);
        assert!(!scratch.exists());
    }
}
