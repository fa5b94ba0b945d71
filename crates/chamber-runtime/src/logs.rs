//! Per-container console logs.
//!
//! In background mode the terminal holder appends everything the guest
//! writes to its console here.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chamber_common::error::{ChamberError, Result};
use chamber_common::types::ContainerName;

/// Returns the console log path for a container.
#[must_use]
pub fn log_path(logs_dir: &Path, name: &ContainerName) -> PathBuf {
    logs_dir.join(format!("{}.console.log", name.sanitized()))
}

/// Reads a container's console log.
///
/// Returns an empty string if the log file does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(logs_dir: &Path, name: &ContainerName) -> Result<String> {
    let path = log_path(logs_dir, name);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(ChamberError::io(path, e)),
    }
}

/// Append-only handle to a console log.
#[derive(Debug)]
pub struct ConsoleLog {
    path: PathBuf,
    file: File,
}

impl ConsoleLog {
    /// Opens the log for appending, creating the directory and file.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn open(logs_dir: &Path, name: &ContainerName) -> Result<Self> {
        std::fs::create_dir_all(logs_dir).map_err(|e| ChamberError::io(logs_dir, e))?;
        let path = log_path(logs_dir, name);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ChamberError::io(&path, e))?;
        Ok(Self { path, file })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends raw console bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .map_err(|e| ChamberError::io(&self.path, e))
    }
}
