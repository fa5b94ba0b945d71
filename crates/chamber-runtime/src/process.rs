//! Process control for guest inits and helper processes.
//!
//! [`GuestControl`] is the seam between lifecycle decisions and the host's
//! process table, so the stop escalation can be exercised without root.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chamber_common::config::StopTimeouts;
use chamber_common::error::{ChamberError, Result};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::shutdown::GracefulAction;

/// Operations the lifecycle manager performs on running processes.
pub trait GuestControl {
    /// Whether `pid` exists and is neither a zombie nor dead.
    fn is_alive(&self, pid: i32) -> bool;

    /// Sends a raw signal number to `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn signal(&self, pid: i32, signal: i32) -> Result<()>;

    /// Runs `argv` inside the namespaces of `pid`, giving up after
    /// `timeout`. Returns the exit code if the command finished in time.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespaces cannot be joined or the helper
    /// cannot be forked.
    fn run_in_guest(&self, pid: i32, argv: &[String], timeout: Duration) -> Result<Option<i32>>;
}

/// [`GuestControl`] backed by the real process table.
#[derive(Debug, Clone)]
pub struct HostProcesses {
    proc_root: PathBuf,
}

impl HostProcesses {
    /// Creates a controller reading process state from `proc_root`.
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl GuestControl for HostProcesses {
    fn is_alive(&self, pid: i32) -> bool {
        chamber_core::procfs::is_live(&self.proc_root, pid)
    }

    fn signal(&self, pid: i32, signal: i32) -> Result<()> {
        send_raw_signal(pid, signal)
    }

    fn run_in_guest(&self, pid: i32, argv: &[String], timeout: Duration) -> Result<Option<i32>> {
        let helper = crate::exec::spawn_in_guest(&self.proc_root, pid, argv)?;
        let code = wait_exit_timeout(helper, timeout, Duration::from_millis(50))?;
        if code.is_none() {
            tracing::warn!(pid, ?argv, "guest command still running, killing helper");
            let _ = nix::sys::signal::kill(helper, nix::sys::signal::Signal::SIGKILL);
            let _ = wait_exit_code(helper);
        }
        Ok(code)
    }
}

/// Sends a signal by number, including realtime signals `nix::Signal`
/// cannot represent.
///
/// # Errors
///
/// Returns an error if `kill(2)` fails.
pub fn send_raw_signal(pid: i32, signal: i32) -> Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        return Err(ChamberError::PermissionDenied {
            message: format!("kill({pid}, {signal}) failed: {}", std::io::Error::last_os_error()),
        });
    }
    tracing::debug!(pid, signal, "signal sent");
    Ok(())
}

/// Maps a wait status to a shell-style exit code (128 + signal when killed).
#[must_use]
pub const fn exit_code_of(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// Blocks until `child` terminates and returns its exit code.
///
/// # Errors
///
/// Returns an error if `waitpid(2)` fails for a reason other than `EINTR`.
pub fn wait_exit_code(child: Pid) -> Result<i32> {
    loop {
        match waitpid(child, None) {
            Ok(status) => {
                if let Some(code) = exit_code_of(status) {
                    return Ok(code);
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                return Err(ChamberError::PermissionDenied {
                    message: format!("waitpid({child}) failed: {e}"),
                });
            }
        }
    }
}

/// Non-blocking check whether `child` has terminated.
///
/// # Errors
///
/// Returns an error if `waitpid(2)` fails.
pub fn try_wait(child: Pid) -> Result<Option<i32>> {
    match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => Ok(exit_code_of(status)),
        Err(Errno::EINTR) => Ok(None),
        Err(e) => Err(ChamberError::PermissionDenied {
            message: format!("waitpid({child}) failed: {e}"),
        }),
    }
}

/// Polls `child` until it exits or `timeout` elapses.
///
/// # Errors
///
/// Returns an error if `waitpid(2)` fails.
pub fn wait_exit_timeout(child: Pid, timeout: Duration, poll: Duration) -> Result<Option<i32>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(code) = try_wait(child)? {
            return Ok(Some(code));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

/// Which stage of the stop escalation ended the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The init system shut down on its own.
    Graceful,
    /// `SIGTERM` was needed.
    Terminated,
    /// `SIGKILL` was needed.
    Killed,
    /// The process was still present after `SIGKILL`.
    Lingering,
}

/// Waits up to `budget` for `pid` to disappear, checking every `poll`.
pub fn wait_gone(ctl: &dyn GuestControl, pid: i32, budget: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if !ctl.is_alive(pid) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

/// Stops `pid`: graceful action, then `SIGTERM`, then `SIGKILL`, each stage
/// bounded by its timeout.
pub fn escalate_stop(
    ctl: &dyn GuestControl,
    pid: i32,
    action: &GracefulAction,
    timeouts: &StopTimeouts,
) -> StopOutcome {
    let started = Instant::now();
    match action {
        GracefulAction::Signal(signal) => {
            if let Err(e) = ctl.signal(pid, *signal) {
                tracing::warn!(pid, signal, error = %e, "graceful signal failed");
            }
        }
        GracefulAction::Command(argv) => match ctl.run_in_guest(pid, argv, timeouts.graceful) {
            Ok(code) => tracing::debug!(pid, ?argv, ?code, "graceful command ran"),
            Err(e) => tracing::warn!(pid, ?argv, error = %e, "graceful command failed"),
        },
    }
    let remaining = timeouts.graceful.saturating_sub(started.elapsed());
    if wait_gone(ctl, pid, remaining, timeouts.poll) {
        tracing::info!(pid, "guest shut down gracefully");
        return StopOutcome::Graceful;
    }

    tracing::info!(pid, "graceful shutdown timed out, sending SIGTERM");
    if let Err(e) = ctl.signal(pid, libc::SIGTERM) {
        tracing::warn!(pid, error = %e, "SIGTERM failed");
    }
    if wait_gone(ctl, pid, timeouts.terminate, timeouts.poll) {
        return StopOutcome::Terminated;
    }

    tracing::warn!(pid, "guest ignored SIGTERM, sending SIGKILL");
    if let Err(e) = ctl.signal(pid, libc::SIGKILL) {
        tracing::warn!(pid, error = %e, "SIGKILL failed");
    }
    if wait_gone(ctl, pid, timeouts.kill, timeouts.poll) {
        return StopOutcome::Killed;
    }
    tracing::error!(pid, "guest init survived SIGKILL");
    StopOutcome::Lingering
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    /// Dies when it receives `fatal`; records everything it was sent.
    struct Scripted {
        fatal: Option<i32>,
        alive: RefCell<bool>,
        sent: RefCell<Vec<i32>>,
        commands: RefCell<Vec<Vec<String>>>,
    }

    impl Scripted {
        fn new(fatal: Option<i32>) -> Self {
            Self {
                fatal,
                alive: RefCell::new(true),
                sent: RefCell::new(Vec::new()),
                commands: RefCell::new(Vec::new()),
            }
        }
    }

    impl GuestControl for Scripted {
        fn is_alive(&self, _pid: i32) -> bool {
            *self.alive.borrow()
        }

        fn signal(&self, _pid: i32, signal: i32) -> Result<()> {
            self.sent.borrow_mut().push(signal);
            if Some(signal) == self.fatal {
                *self.alive.borrow_mut() = false;
            }
            Ok(())
        }

        fn run_in_guest(&self, _pid: i32, argv: &[String], _timeout: Duration) -> Result<Option<i32>> {
            self.commands.borrow_mut().push(argv.to_vec());
            Ok(Some(0))
        }
    }

    fn fast() -> StopTimeouts {
        StopTimeouts {
            graceful: Duration::from_millis(30),
            terminate: Duration::from_millis(60),
            kill: Duration::from_millis(30),
            poll: Duration::from_millis(5),
        }
    }

    #[test]
    fn graceful_signal_is_enough() {
        let ctl = Scripted::new(Some(libc::SIGUSR2));
        let outcome = escalate_stop(&ctl, 10, &GracefulAction::Signal(libc::SIGUSR2), &fast());
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(*ctl.sent.borrow(), vec![libc::SIGUSR2]);
    }

    #[test]
    fn command_then_sigterm() {
        let ctl = Scripted::new(Some(libc::SIGTERM));
        let action = GracefulAction::Command(vec!["poweroff".into()]);
        let outcome = escalate_stop(&ctl, 10, &action, &fast());
        assert_eq!(outcome, StopOutcome::Terminated);
        assert_eq!(*ctl.commands.borrow(), vec![vec!["poweroff".to_string()]]);
        assert_eq!(*ctl.sent.borrow(), vec![libc::SIGTERM]);
    }

    #[test]
    fn escalates_to_sigkill_within_budget() {
        let ctl = Scripted::new(Some(libc::SIGKILL));
        let timeouts = fast();
        let started = Instant::now();
        let outcome = escalate_stop(&ctl, 10, &GracefulAction::Signal(libc::SIGUSR2), &timeouts);
        assert_eq!(outcome, StopOutcome::Killed);
        assert_eq!(*ctl.sent.borrow(), vec![libc::SIGUSR2, libc::SIGTERM, libc::SIGKILL]);
        let budget = timeouts.graceful + timeouts.terminate + timeouts.kill;
        assert!(started.elapsed() < budget + Duration::from_millis(200));
    }

    #[test]
    fn unkillable_guest_is_reported() {
        let ctl = Scripted::new(None);
        let outcome = escalate_stop(&ctl, 10, &GracefulAction::Signal(libc::SIGUSR2), &fast());
        assert_eq!(outcome, StopOutcome::Lingering);
    }

    #[test]
    fn exit_codes_follow_shell_convention() {
        let pid = Pid::from_raw(1);
        assert_eq!(exit_code_of(WaitStatus::Exited(pid, 3)), Some(3));
        assert_eq!(
            exit_code_of(WaitStatus::Signaled(pid, nix::sys::signal::Signal::SIGKILL, false)),
            Some(137)
        );
        assert_eq!(exit_code_of(WaitStatus::StillAlive), None);
    }

    #[test]
    fn real_child_exit_code_is_relayed() {
        let child = std::process::Command::new("sh")
            .args(["-c", "exit 7"])
            .spawn()
            .expect("spawn sh");
        let pid = Pid::from_raw(i32::try_from(child.id()).expect("pid fits"));
        assert_eq!(wait_exit_code(pid).expect("wait"), 7);
    }
}
