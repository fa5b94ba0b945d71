//! Unified error types for the chamber workspace.
//!
//! Library crates return [`ChamberError`]; the CLI wraps it in `anyhow`
//! and maps it back to a process exit code through
//! [`ChamberError::exit_code`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum ChamberError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A container with this name is already running.
    #[error("container {name} is already running (pid {pid})")]
    AlreadyRunning {
        /// Container name.
        name: String,
        /// Global PID of the running init.
        pid: i32,
    },

    /// The host does not satisfy a runtime requirement.
    #[error("requirements not met: {message}")]
    Requirements {
        /// Description of the missing requirement.
        message: String,
    },

    /// The guest init could not be located within the discovery budget.
    #[error("container {name} did not come up within {waited:?}")]
    StartTimeout {
        /// Container name.
        name: String,
        /// Time spent waiting.
        waited: Duration,
    },

    /// A permission or syscall-level refusal.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// A mount or unmount failed.
    #[error("mount failed at {target}: {message}")]
    Mount {
        /// Mount target.
        target: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// The guest boot sequence failed at a specific stage.
    #[error("boot stage {stage} failed: {message}")]
    Boot {
        /// Name of the failing stage.
        stage: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl ChamberError {
    /// Exit code reported by the CLI for this error.
    ///
    /// 1 generic, 2 already running, 3 requirements not met,
    /// 4 start timed out, 5 not found.
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::AlreadyRunning { .. } => 2,
            Self::Requirements { .. } => 3,
            Self::StartTimeout { .. } => 4,
            Self::NotFound { .. } => 5,
            _ => 1,
        }
    }

    /// Builds an [`ChamberError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a [`ChamberError::NotFound`] for a container name.
    pub fn container_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "container",
            id: name.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ChamberError>;
