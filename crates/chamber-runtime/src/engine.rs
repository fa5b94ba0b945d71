//! Runtime engine that orchestrates container lifecycle.

use std::cell::Cell;
use std::path::PathBuf;

use chamber_common::config::{ContainerConfig, RootfsSource, RuntimeSettings};
use chamber_common::error::{ChamberError, Result};
use chamber_common::types::{ContainerName, ContainerState, Health, MarkerToken};
use chamber_core::filesystem::image::{mount_image, unmount_image};
use chamber_core::pty::PtySet;
use chrono::Utc;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;

use crate::bootstrap::{BootContext, spawn_launcher};
use crate::console;
use crate::discovery;
use crate::exec::{self, ExecTarget};
use crate::lifecycle::{ContainerInfo, ContainerStatus, Lifecycle, StopReport, carries_identity, volatile_dir};
use crate::logs::ConsoleLog;
use crate::network;
use crate::process::{GuestControl, try_wait, wait_exit_code};
use crate::requirements;
use crate::shutdown::ShutdownPolicy;
use crate::state::ContainerRecord;

/// How a start request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Running in the background under a holder.
    Background(ContainerRecord),
    /// Ran in the foreground and has exited with this status.
    Exited(i32),
}

/// Host resources acquired during a start, released if the start fails.
#[derive(Debug, Default)]
struct Rollback {
    launcher: Option<Pid>,
    guest: Option<Pid>,
    seed: Option<PathBuf>,
    image_mount: Option<PathBuf>,
    scratch: Option<PathBuf>,
}

impl Rollback {
    fn run(self) {
        if let Some(guest) = self.guest {
            let _ = kill(guest, Signal::SIGKILL);
        }
        if let Some(launcher) = self.launcher {
            let _ = killpg(launcher, Signal::SIGKILL);
            let _ = kill(launcher, Signal::SIGKILL);
            let _ = wait_exit_code(launcher);
        }
        if let Some(seed) = &self.seed {
            let _ = std::fs::remove_file(seed);
        }
        if let Some(mount) = &self.image_mount {
            if let Err(e) = unmount_image(mount) {
                tracing::warn!(mount = %mount.display(), error = %e, "rollback: image not unmounted");
            }
        }
        if let Some(scratch) = &self.scratch {
            let _ = std::fs::remove_dir_all(scratch);
        }
        tracing::debug!("start rolled back");
    }
}

/// The runtime engine that coordinates all container operations.
///
/// Start, enter and run fork real processes; every other operation goes
/// through the [`Lifecycle`] and its pluggable process controller.
#[derive(Debug)]
pub struct Engine {
    lifecycle: Lifecycle,
}

impl Engine {
    /// Creates an engine over the host process table.
    ///
    /// # Errors
    ///
    /// Returns an error if the records directory cannot be created.
    pub fn new(settings: RuntimeSettings) -> Result<Self> {
        Ok(Self {
            lifecycle: Lifecycle::new(settings)?,
        })
    }

    /// Creates an engine with a custom process controller and shutdown
    /// policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the records directory cannot be created.
    pub fn with_parts(
        settings: RuntimeSettings,
        ctl: Box<dyn GuestControl>,
        policy: Box<dyn ShutdownPolicy>,
    ) -> Result<Self> {
        Ok(Self {
            lifecycle: Lifecycle::with_parts(settings, ctl, policy)?,
        })
    }

    /// Underlying lifecycle manager.
    #[must_use]
    pub const fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Runtime settings.
    #[must_use]
    pub const fn settings(&self) -> &RuntimeSettings {
        self.lifecycle.settings()
    }

    /// Boots a container.
    ///
    /// In the foreground this returns once the container has exited; in the
    /// background it returns the persisted record.
    ///
    /// # Errors
    ///
    /// Returns [`ChamberError::Requirements`] for an unsuitable host,
    /// [`ChamberError::AlreadyRunning`] for a duplicate name,
    /// [`ChamberError::StartTimeout`] if the guest init never appears, or
    /// any setup error. Resources acquired so far are released.
    pub fn start(&self, config: &ContainerConfig) -> Result<StartOutcome> {
        self.start_from(config, ContainerState::Absent)
    }

    fn start_from(&self, config: &ContainerConfig, from: ContainerState) -> Result<StartOutcome> {
        let settings = self.settings();
        let report = requirements::inspect(&settings.proc_root);
        report.ensure_ready()?;
        if config.features.volatile && !report.supports_overlay() {
            return Err(ChamberError::Requirements {
                message: "volatile mode needs overlayfs".into(),
            });
        }
        if config.rootfs.is_image() && !report.mount_helper {
            return Err(ChamberError::Requirements {
                message: "image roots need the `mount` helper".into(),
            });
        }
        self.lifecycle.ensure_absent(&config.name)?;
        let state = from.transition(ContainerState::Starting)?;
        tracing::info!(name = %config.name, %state, rootfs = %config.rootfs.path().display(), "starting container");

        if config.features.selinux_permissive {
            if let Err(e) = network::set_selinux_permissive() {
                tracing::warn!(error = %e, "selinux left enforcing");
            }
        }

        let mut rollback = Rollback::default();
        match self.boot(config, &mut rollback) {
            Ok((record, pty, launcher)) => {
                tracing::info!(name = %record.name, pid = record.pid, state = %record.state, "container running");
                self.attach(config, record, pty, launcher)
            }
            Err(e) => {
                tracing::error!(name = %config.name, error = %e, "start failed, rolling back");
                rollback.run();
                Err(e)
            }
        }
    }

    fn boot(&self, config: &ContainerConfig, rollback: &mut Rollback) -> Result<(ContainerRecord, PtySet, Pid)> {
        let settings = self.settings();
        let (root, mount_path) = match &config.rootfs {
            RootfsSource::Directory(dir) => (dir.clone(), None),
            RootfsSource::Image(image) => {
                let target = settings.mounts_dir().join(config.name.sanitized());
                if mount_image(image, &target)? {
                    rollback.image_mount = Some(target.clone());
                }
                (target.clone(), Some(target))
            }
        };

        let volatile_scratch = if config.features.volatile {
            let scratch = volatile_dir(settings, &config.name);
            std::fs::create_dir_all(&scratch).map_err(|e| ChamberError::io(&scratch, e))?;
            rollback.scratch = Some(scratch.clone());
            Some(scratch)
        } else {
            None
        };

        let token = MarkerToken::generate();
        let seed = token.seed_path(&root);
        std::fs::write(&seed, token.as_str()).map_err(|e| ChamberError::io(&seed, e))?;
        rollback.seed = Some(seed);

        let pty = PtySet::allocate(config.tty_count)?;
        let ctx = BootContext {
            config,
            root: root.clone(),
            token: &token,
            slaves: pty.slave_paths(),
            proc_root: settings.proc_root.clone(),
            network_hook: settings.network_hook.clone(),
            volatile_scratch,
        };
        let launcher = spawn_launcher(&ctx)?;
        rollback.launcher = Some(launcher);

        let launcher_exited = Cell::new(false);
        let ctl = self.lifecycle.control();
        let found = discovery::discover_ready(
            &settings.proc_root,
            &token,
            config.name.as_str(),
            &settings.discovery,
            |pid| carries_identity(&settings.proc_root, ctl, pid, Some(&config.name)),
            || {
                let exited = !matches!(try_wait(launcher), Ok(None));
                launcher_exited.set(exited);
                exited
            },
        );
        if launcher_exited.get() {
            rollback.launcher = None;
        }
        let pid = found?;
        rollback.guest = Some(Pid::from_raw(pid));
        discovery::clear_markers(&settings.proc_root, pid, &token, &root);

        let record = ContainerRecord {
            name: config.name.clone(),
            pid,
            rootfs: config.rootfs.path().to_path_buf(),
            mount_path,
            hw_access: config.features.hw_access,
            holder_pid: None,
            started_at: Utc::now(),
            state: ContainerState::Starting.transition(ContainerState::Running)?,
        };
        self.lifecycle.store().save(&record)?;
        self.lifecycle.store().save_config(config)?;
        Ok((record, pty, launcher))
    }

    fn attach(
        &self,
        config: &ContainerConfig,
        mut record: ContainerRecord,
        mut pty: PtySet,
        launcher: Pid,
    ) -> Result<StartOutcome> {
        let settings = self.settings();
        if config.foreground {
            let code = console::supervise(&mut pty, launcher, record.pid)?;
            drop(pty);
            self.lifecycle.release(&record, false);
            return Ok(StartOutcome::Exited(code));
        }

        let holder = ConsoleLog::open(&settings.logs_dir(), &config.name)
            .and_then(|log| console::spawn_holder(pty, record.pid, log, &settings.proc_root));
        match holder {
            Ok(holder) => {
                record.holder_pid = Some(holder.as_raw());
                self.lifecycle.store().save(&record)?;
                Ok(StartOutcome::Background(record))
            }
            Err(e) => {
                tracing::error!(name = %record.name, error = %e, "console holder failed, stopping container");
                let _ = self.lifecycle.stop(&record.name, false);
                Err(e)
            }
        }
    }

    /// Stops a container. Absent containers are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store cannot be read.
    pub fn stop(&self, name: &ContainerName) -> Result<StopReport> {
        self.lifecycle.stop(name, false)
    }

    /// Stops every container in a comma-separated list.
    pub fn stop_many(&self, names: &str) -> Vec<(String, Result<StopReport>)> {
        self.lifecycle.stop_many(names)
    }

    /// Stops a container, keeping any image mount, then starts it again
    /// with its persisted configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ChamberError::NotFound`] if no configuration was persisted,
    /// or any start error.
    pub fn restart(&self, name: &ContainerName) -> Result<StartOutcome> {
        let config = self
            .lifecycle
            .store()
            .load_config(name)?
            .ok_or_else(|| ChamberError::container_not_found(name.as_str()))?;
        let report = self.lifecycle.stop_for_restart(name)?;
        let from = if matches!(report, StopReport::Stopped(_)) {
            ContainerState::Restarting
        } else {
            ContainerState::Absent
        };
        tracing::info!(name = %name, ?report, pause = ?self.settings().restart_pause, "restarting container");
        std::thread::sleep(self.settings().restart_pause);
        self.start_from(&config, from)
    }

    /// Status of a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store cannot be read.
    pub fn status(&self, name: &ContainerName) -> Result<ContainerStatus> {
        self.lifecycle.status(name)
    }

    /// Details of a running container.
    ///
    /// # Errors
    ///
    /// Returns [`ChamberError::NotFound`] if it is not running.
    pub fn info(&self, name: &ContainerName) -> Result<ContainerInfo> {
        self.lifecycle.info(name)
    }

    /// Every running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store cannot be read.
    pub fn show(&self) -> Result<Vec<(ContainerRecord, Health)>> {
        self.lifecycle.show()
    }

    /// Registers running containers that have no record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store cannot be read or written.
    pub fn scan(&self) -> Result<Vec<ContainerRecord>> {
        self.lifecycle.scan()
    }

    /// Opens an interactive shell in a running container.
    ///
    /// # Errors
    ///
    /// Returns [`ChamberError::NotFound`] if the container or a shell is
    /// missing.
    pub fn enter(&self, name: &ContainerName, user: Option<String>) -> Result<i32> {
        self.run_target(name, &ExecTarget::Shell { user })
    }

    /// Runs a command in a running container and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns [`ChamberError::NotFound`] if the container is not running.
    pub fn run(&self, name: &ContainerName, argv: Vec<String>) -> Result<i32> {
        self.run_target(name, &ExecTarget::Command(argv))
    }

    fn run_target(&self, name: &ContainerName, target: &ExecTarget) -> Result<i32> {
        let record = self
            .lifecycle
            .live_record(name)?
            .ok_or_else(|| ChamberError::container_not_found(name.as_str()))?;
        exec::run_in_guest(&self.settings().proc_root, record.pid, target)
    }
}
