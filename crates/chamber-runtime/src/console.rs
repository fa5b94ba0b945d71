//! Console plumbing between the host and a running guest.
//!
//! In the foreground the caller's terminal is put in raw mode and bytes are
//! relayed to and from the console master until the launcher exits. In the
//! background a holder process takes the masters over, appends console
//! output to the container's log and exits once the guest is gone.

use std::fs::{File, OpenOptions};
use std::io::{IsTerminal, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use chamber_common::error::{ChamberError, Result};
use chamber_core::procfs;
use chamber_core::pty::{PtySet, propagate_window_size};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigHandler, SigSet, Signal, signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use nix::unistd::{ForkResult, Pid, fork, setsid};

use crate::logs::ConsoleLog;
use crate::process::{send_raw_signal, try_wait};

const RELAY_BUFFER: usize = 4096;
const POLL_TICK_MS: u16 = 1000;

/// Back-off after a hang-up with nothing to read.
const HANGUP_BACKOFF: Duration = Duration::from_millis(100);

/// Restores the saved terminal attributes when dropped.
struct RawTerminal {
    fd: OwnedFd,
    saved: Termios,
}

impl RawTerminal {
    fn enable() -> Option<Self> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return None;
        }
        let fd = stdin.as_fd().try_clone_to_owned().ok()?;
        let saved = tcgetattr(&fd).ok()?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        if let Err(e) = tcsetattr(&fd, SetArg::TCSANOW, &raw) {
            tracing::warn!(error = %e, "terminal left in cooked mode");
            return None;
        }
        Some(Self { fd, saved })
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = tcsetattr(&self.fd, SetArg::TCSANOW, &self.saved);
    }
}

fn relay_signals() -> SigSet {
    let mut mask = SigSet::empty();
    for sig in [
        Signal::SIGCHLD,
        Signal::SIGWINCH,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
    ] {
        mask.add(sig);
    }
    mask
}

fn dup_stdio(fd: std::os::fd::BorrowedFd<'_>) -> Result<File> {
    fd.try_clone_to_owned()
        .map(File::from)
        .map_err(|e| ChamberError::io("stdio", e))
}

/// Relays the caller's terminal to the guest console until the launcher
/// exits, returning the launcher's exit status.
///
/// `SIGINT`, `SIGTERM` and `SIGHUP` received meanwhile are forwarded to the
/// guest init; `SIGWINCH` resizes the console.
///
/// # Errors
///
/// Returns an error if the signal descriptor or stdio cannot be set up, or
/// polling fails.
pub fn supervise(pty: &mut PtySet, launcher: Pid, guest_pid: i32) -> Result<i32> {
    let mask = relay_signals();
    mask.thread_block().map_err(|e| ChamberError::PermissionDenied {
        message: format!("block signals: {e}"),
    })?;
    let result = relay(pty, launcher, guest_pid, &mask);
    let _ = mask.thread_unblock();
    result
}

fn relay(pty: &mut PtySet, launcher: Pid, guest_pid: i32, mask: &SigSet) -> Result<i32> {
    let mut sfd = SignalFd::with_flags(mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK).map_err(|e| {
        ChamberError::PermissionDenied {
            message: format!("signalfd: {e}"),
        }
    })?;
    let mut input = dup_stdio(std::io::stdin().as_fd())?;
    let mut output = dup_stdio(std::io::stdout().as_fd())?;
    let _raw = RawTerminal::enable();
    propagate_window_size(input.as_fd(), pty.console_mut().master());

    let mut stdin_open = true;
    let mut buf = [0u8; RELAY_BUFFER];
    loop {
        if let Some(code) = try_wait(launcher)? {
            tracing::info!(code, "container exited");
            return Ok(code);
        }

        let (stdin_ready, master_ready, signal_ready) = {
            let master = pty.console_mut().master();
            let stdin_events = if stdin_open { PollFlags::POLLIN } else { PollFlags::empty() };
            let mut fds = [
                PollFd::new(input.as_fd(), stdin_events),
                PollFd::new(master.as_fd(), PollFlags::POLLIN),
                PollFd::new(sfd.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::from(POLL_TICK_MS)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    return Err(ChamberError::PermissionDenied {
                        message: format!("poll: {e}"),
                    });
                }
            }
            let revents = |fd: &PollFd<'_>| fd.revents().unwrap_or_else(PollFlags::empty);
            (revents(&fds[0]), revents(&fds[1]), revents(&fds[2]))
        };

        if stdin_ready.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
            match input.read(&mut buf) {
                Ok(0) | Err(_) => stdin_open = false,
                Ok(n) => {
                    if let Err(e) = pty.console_mut().master_mut().write_all(&buf[..n]) {
                        tracing::debug!(error = %e, "console input dropped");
                    }
                }
            }
        }

        if master_ready.contains(PollFlags::POLLIN) {
            if let Ok(n) = pty.console_mut().master_mut().read(&mut buf) {
                let _ = output.write_all(&buf[..n]);
                let _ = output.flush();
            }
        } else if master_ready.contains(PollFlags::POLLHUP) {
            std::thread::sleep(HANGUP_BACKOFF);
        }

        if signal_ready.contains(PollFlags::POLLIN) {
            while let Ok(Some(info)) = sfd.read_signal() {
                let signo = i32::try_from(info.ssi_signo).unwrap_or_default();
                handle_signal(signo, pty, &input, guest_pid);
            }
        }
    }
}

fn handle_signal(signo: i32, pty: &mut PtySet, input: &File, guest_pid: i32) {
    match Signal::try_from(signo) {
        Ok(Signal::SIGWINCH) => propagate_window_size(input.as_fd(), pty.console_mut().master()),
        Ok(Signal::SIGINT | Signal::SIGTERM | Signal::SIGHUP) => {
            tracing::info!(signal = signo, pid = guest_pid, "forwarding signal to container");
            if let Err(e) = send_raw_signal(guest_pid, signo) {
                tracing::warn!(error = %e, "signal not forwarded");
            }
        }
        _ => {}
    }
}

/// Forks the background holder that owns the PTY masters from now on.
///
/// # Errors
///
/// Returns an error if the fork fails.
pub fn spawn_holder(mut pty: PtySet, guest_pid: i32, log: ConsoleLog, proc_root: &Path) -> Result<Pid> {
    // SAFETY: the runtime is single-threaded; the child only drains the
    // masters and exits.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!(holder = %child, guest_pid, "console holder started");
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            detach_holder();
            hold(&mut pty, guest_pid, log, proc_root);
            std::process::exit(0)
        }
        Err(e) => Err(ChamberError::PermissionDenied {
            message: format!("fork holder: {e}"),
        }),
    }
}

fn detach_holder() {
    let _ = setsid();
    for sig in [Signal::SIGHUP, Signal::SIGINT] {
        // SAFETY: ignoring a signal has no preconditions.
        let _ = unsafe { signal(sig, SigHandler::SigIgn) };
    }
    if let Ok(null) = OpenOptions::new().read(true).write(true).open("/dev/null") {
        for fd in 0..=2 {
            // SAFETY: both descriptors are valid for the duration of the call.
            let _ = unsafe { libc::dup2(null.as_raw_fd(), fd) };
        }
    }
}

fn hold(pty: &mut PtySet, guest_pid: i32, mut log: ConsoleLog, proc_root: &Path) {
    let mut buf = [0u8; RELAY_BUFFER];
    while procfs::is_live(proc_root, guest_pid) {
        let mut masters = pty.masters_mut();
        let ready: Vec<PollFlags> = {
            let mut fds: Vec<PollFd<'_>> = masters
                .iter()
                .map(|m| PollFd::new(m.as_fd(), PollFlags::POLLIN))
                .collect();
            match poll(&mut fds, PollTimeout::from(POLL_TICK_MS)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(_) => return,
            }
            fds.iter().map(|fd| fd.revents().unwrap_or_else(PollFlags::empty)).collect()
        };

        let mut hung_up = false;
        for (index, (master, flags)) in masters.iter_mut().zip(ready).enumerate() {
            if flags.contains(PollFlags::POLLIN) {
                if let Ok(n) = master.read(&mut buf) {
                    if index == 0 {
                        let _ = log.append(&buf[..n]);
                    }
                }
            } else if flags.contains(PollFlags::POLLHUP) {
                hung_up = true;
            }
        }
        if hung_up {
            std::thread::sleep(HANGUP_BACKOFF);
        }
    }
}
