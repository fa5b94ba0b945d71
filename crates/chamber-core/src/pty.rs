//! Pseudo-terminal allocation for the guest console and virtual terminals.
//!
//! Pairs are allocated by the host before the container is forked. Only the
//! slave paths cross into the container, where they are bound over
//! `/dev/console` and `/dev/ttyN`. The masters stay with whichever host
//! process owns the terminal plumbing and are close-on-exec, so the guest
//! init never inherits one.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::PathBuf;

use chamber_common::error::{ChamberError, Result};
use nix::fcntl::OFlag;
use nix::pty::{PtyMaster, grantpt, posix_openpt, ptsname_r, unlockpt};

/// One master handle and the path of its slave.
#[derive(Debug)]
pub struct PtyPair {
    master: PtyMaster,
    slave_path: PathBuf,
}

impl PtyPair {
    /// Allocates a pair without opening the slave side.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the `posix_openpt` steps fails.
    pub fn open() -> Result<Self> {
        let fail = |step: &str, e: nix::Error| ChamberError::PermissionDenied {
            message: format!("{step} failed: {e}"),
        };
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
            .map_err(|e| fail("posix_openpt", e))?;
        grantpt(&master).map_err(|e| fail("grantpt", e))?;
        unlockpt(&master).map_err(|e| fail("unlockpt", e))?;
        let slave_path = PathBuf::from(ptsname_r(&master).map_err(|e| fail("ptsname_r", e))?);
        Ok(Self { master, slave_path })
    }

    /// Path of the slave device, e.g. `/dev/pts/3`.
    #[must_use]
    pub const fn slave_path(&self) -> &PathBuf {
        &self.slave_path
    }

    /// Master handle.
    #[must_use]
    pub const fn master(&self) -> &PtyMaster {
        &self.master
    }

    /// Mutable master handle, for `Read`/`Write`.
    pub const fn master_mut(&mut self) -> &mut PtyMaster {
        &mut self.master
    }
}

/// Slave paths of a [`PtySet`], the only part handed to the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlavePaths {
    /// Slave bound over `/dev/console`.
    pub console: PathBuf,
    /// Slaves bound over `/dev/tty1..N`, in order.
    pub ttys: Vec<PathBuf>,
}

/// Console pair plus one pair per virtual terminal.
#[derive(Debug)]
pub struct PtySet {
    console: PtyPair,
    ttys: Vec<PtyPair>,
}

impl PtySet {
    /// Allocates the console and `tty_count` terminal pairs.
    ///
    /// # Errors
    ///
    /// Returns an error if any allocation fails; pairs allocated so far are
    /// released.
    pub fn allocate(tty_count: u8) -> Result<Self> {
        let console = PtyPair::open()?;
        let ttys = (0..tty_count)
            .map(|_| PtyPair::open())
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(
            console = %console.slave_path.display(),
            ttys = ttys.len(),
            "pty set allocated"
        );
        Ok(Self { console, ttys })
    }

    /// Plain-data view of the slave paths.
    #[must_use]
    pub fn slave_paths(&self) -> SlavePaths {
        SlavePaths {
            console: self.console.slave_path.clone(),
            ttys: self.ttys.iter().map(|p| p.slave_path.clone()).collect(),
        }
    }

    /// Console pair.
    pub const fn console_mut(&mut self) -> &mut PtyPair {
        &mut self.console
    }

    /// Every master, console first.
    pub fn masters_mut(&mut self) -> Vec<&mut PtyMaster> {
        std::iter::once(&mut self.console)
            .chain(self.ttys.iter_mut())
            .map(PtyPair::master_mut)
            .collect()
    }

    /// Number of pairs including the console.
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.ttys.len()
    }

    /// Always false: a set holds at least the console.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// Terminal window size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// Rows.
    pub rows: u16,
    /// Columns.
    pub cols: u16,
}

/// Reads the window size of the terminal behind `fd`.
///
/// Returns `None` if `fd` is not a terminal.
#[must_use]
pub fn window_size(fd: BorrowedFd<'_>) -> Option<WindowSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes a `winsize` into the pointer, which is valid
    // for the duration of the call.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ as _, &raw mut ws) };
    (rc == 0 && ws.ws_row > 0 && ws.ws_col > 0).then_some(WindowSize {
        rows: ws.ws_row,
        cols: ws.ws_col,
    })
}

/// Applies a window size to a PTY master.
///
/// # Errors
///
/// Returns an error if `TIOCSWINSZ` is rejected.
pub fn set_window_size(master: &PtyMaster, size: WindowSize) -> Result<()> {
    let ws = libc::winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ only reads the `winsize` behind the pointer.
    let rc = unsafe { libc::ioctl(master.as_fd().as_raw_fd(), libc::TIOCSWINSZ as _, &raw const ws) };
    if rc != 0 {
        return Err(ChamberError::PermissionDenied {
            message: format!("TIOCSWINSZ failed: {}", std::io::Error::last_os_error()),
        });
    }
    Ok(())
}

/// Copies the window size of `from` onto `master`, if `from` is a terminal.
pub fn propagate_window_size(from: BorrowedFd<'_>, master: &PtyMaster) {
    if let Some(size) = window_size(from) {
        if let Err(e) = set_window_size(master, size) {
            tracing::debug!(error = %e, "window size not propagated");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn slave_paths_live_under_devpts() {
        let set = PtySet::allocate(2).expect("allocate");
        let paths = set.slave_paths();
        assert_eq!(set.len(), 3);
        assert_eq!(paths.ttys.len(), 2);
        assert!(paths.console.starts_with("/dev/pts"));
        assert_ne!(paths.console, paths.ttys[0]);
        assert_ne!(paths.ttys[0], paths.ttys[1]);
    }

    #[test]
    fn masters_list_console_first() {
        let mut set = PtySet::allocate(1).expect("allocate");
        let console_fd = set.console_mut().master().as_fd().as_raw_fd();
        let masters = set.masters_mut();
        assert_eq!(masters.len(), 2);
        assert_eq!(masters[0].as_fd().as_raw_fd(), console_fd);
    }

    #[test]
    fn slave_output_reaches_master() {
        let mut pair = PtyPair::open().expect("pair");
        let mut slave = OpenOptions::new()
            .read(true)
            .write(true)
            .open(pair.slave_path())
            .expect("open slave");
        slave.write_all(b"ping").expect("write slave");

        let mut buf = [0u8; 16];
        let n = pair.master_mut().read(&mut buf).expect("read master");
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn master_stays_writable_without_a_slave() {
        let mut never_opened = PtyPair::open().expect("pair");
        never_opened.master_mut().write_all(b"x").expect("write");

        let mut closed = PtyPair::open().expect("pair");
        drop(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(closed.slave_path())
                .expect("open slave"),
        );
        closed.master_mut().write_all(b"y").expect("write after slave closed");
    }

    #[test]
    fn window_size_round_trips_through_master() {
        let pair = PtyPair::open().expect("pair");
        let size = WindowSize { rows: 40, cols: 120 };
        set_window_size(pair.master(), size).expect("set");
        assert_eq!(window_size(pair.master().as_fd()), Some(size));
    }
}
