//! Domain primitive types used across the chamber workspace.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_NAME_LEN, SEED_PREFIX};
use crate::error::{ChamberError, Result};

/// Validated, human-chosen container name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerName(String);

impl ContainerName {
    /// Creates a container name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, too long, or contains
    /// control characters, `/`, or `,` (reserved for bulk stop).
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(ChamberError::Config {
                message: "container name is empty".into(),
            });
        }
        if trimmed.len() > MAX_NAME_LEN {
            return Err(ChamberError::Config {
                message: format!("container name longer than {MAX_NAME_LEN} bytes: {trimmed}"),
            });
        }
        if trimmed
            .chars()
            .any(|c| c.is_control() || c == '/' || c == ',')
        {
            return Err(ChamberError::Config {
                message: format!("container name contains a forbidden character: {trimmed:?}"),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe key used by the record store.
    ///
    /// Everything outside `[A-Za-z0-9._-]` becomes `_`, and a leading
    /// dot is replaced so records never turn into hidden files.
    #[must_use]
    pub fn sanitized(&self) -> String {
        let mut key: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if key.starts_with('.') {
            key.replace_range(0..1, "_");
        }
        key
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ContainerName {
    type Error = ChamberError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ContainerName> for String {
    fn from(value: ContainerName) -> Self {
        value.0
    }
}

/// One-time, high-entropy identifier used to find a freshly booted guest
/// init from the host PID namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarkerToken(String);

impl MarkerToken {
    /// Generates a fresh token from a random UUID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("chamber-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Wraps an existing token string, typically read back from a seed file.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is empty or could escape `/run`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.contains('/') || raw.starts_with('.') {
            return Err(ChamberError::Config {
                message: format!("invalid marker token: {raw:?}"),
            });
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the marker relative to a guest root (`run/<token>`).
    #[must_use]
    pub fn run_relative(&self) -> PathBuf {
        Path::new("run").join(&self.0)
    }

    /// Path of this token's seed file inside a rootfs.
    ///
    /// The token is part of the file name so concurrent starts sharing a
    /// rootfs never overwrite each other's seed.
    #[must_use]
    pub fn seed_path(&self, rootfs: &Path) -> PathBuf {
        rootfs.join(format!("{SEED_PREFIX}.{}", self.0))
    }
}

impl fmt::Display for MarkerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// No valid record exists.
    Absent,
    /// Namespaces are being created and the guest is booting.
    Starting,
    /// Guest init is alive and validated.
    Running,
    /// The stop escalation is in progress.
    Stopping,
    /// Stopped on the way to a new start.
    Restarting,
}

impl ContainerState {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Absent, Self::Starting)
                | (Self::Starting, Self::Running | Self::Absent)
                | (Self::Running, Self::Stopping | Self::Restarting)
                | (Self::Stopping, Self::Absent)
                | (Self::Restarting, Self::Starting | Self::Absent)
        )
    }

    /// Moves to `next`, rejecting transitions the state machine forbids.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is not allowed.
    pub fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition(next) {
            Ok(next)
        } else {
            Err(ChamberError::Config {
                message: format!("illegal lifecycle transition {self} -> {next}"),
            })
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Restarting => write!(f, "restarting"),
        }
    }
}

/// Health of a running container's terminal plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    /// Terminal owner (foreground supervisor or holder) is alive.
    Healthy,
    /// The background holder exited while the guest kept running.
    Unhealthy,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rejects_separators_and_blank() {
        assert!(ContainerName::new("").is_err());
        assert!(ContainerName::new("   ").is_err());
        assert!(ContainerName::new("a/b").is_err());
        assert!(ContainerName::new("a,b").is_err());
        assert!(ContainerName::new("x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn name_is_trimmed() {
        let name = ContainerName::new("  debian  ").unwrap();
        assert_eq!(name.as_str(), "debian");
    }

    #[test]
    fn sanitized_key_is_file_safe() {
        let name = ContainerName::new(".my box:1").unwrap();
        assert_eq!(name.sanitized(), "_my_box_1");
        let plain = ContainerName::new("alpine-test").unwrap();
        assert_eq!(plain.sanitized(), "alpine-test");
    }

    #[test]
    fn tokens_are_unique_per_generation() {
        let a = MarkerToken::generate();
        let b = MarkerToken::generate();
        assert_ne!(a, b);
        assert!(a.as_str().len() > 32);
    }

    #[test]
    fn token_parse_rejects_path_escape() {
        assert!(MarkerToken::parse("../etc").is_err());
        assert!(MarkerToken::parse("").is_err());
        let t = MarkerToken::parse("chamber-abc\n").unwrap();
        assert_eq!(t.run_relative(), PathBuf::from("run/chamber-abc"));
        assert_eq!(
            t.seed_path(Path::new("/srv/rootfs")),
            PathBuf::from("/srv/rootfs/.chamber-seed.chamber-abc")
        );
    }

    #[test]
    fn lifecycle_allows_documented_paths() {
        use ContainerState::*;
        assert!(Absent.can_transition(Starting));
        assert!(Starting.can_transition(Running));
        assert!(Running.can_transition(Stopping));
        assert!(Stopping.can_transition(Absent));
        assert!(Running.can_transition(Restarting));
        assert!(Restarting.can_transition(Starting));
    }

    #[test]
    fn lifecycle_rejects_shortcuts() {
        use ContainerState::*;
        assert!(Absent.transition(Running).is_err());
        assert!(Running.transition(Starting).is_err());
        assert!(Stopping.transition(Running).is_err());
    }
}
