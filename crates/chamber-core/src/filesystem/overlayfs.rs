//! `OverlayFS` management for volatile container roots.
//!
//! A volatile container runs on an overlay whose lower layer is the real
//! rootfs and whose upper layer lives on a tmpfs, so every change is gone
//! once the mounts are released.

use std::path::{Path, PathBuf};

use chamber_common::error::{ChamberError, Result};
use nix::mount::{MsFlags, mount};

use super::mount::{ensure_dir, mount_fs, unmount};

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Read-only lower layers (bottom to top).
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: PathBuf,
    /// Work directory required by `OverlayFS`.
    pub work_dir: PathBuf,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayConfig {
    /// Lays out `upper`, `work` and `merged` below `scratch` on top of a
    /// single lower layer.
    #[must_use]
    pub fn over(lower: &Path, scratch: &Path) -> Self {
        Self {
            lower_dirs: vec![lower.to_path_buf()],
            upper_dir: scratch.join("upper"),
            work_dir: scratch.join("work"),
            merged_dir: scratch.join("merged"),
        }
    }

    /// Mount options string passed to the kernel.
    #[must_use]
    pub fn options(&self) -> String {
        let lowers = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "lowerdir={lowers},upperdir={},workdir={}",
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// Creates the upper, work, and merged directories if they do not exist.
///
/// # Errors
///
/// Returns an error if directory creation or the mount syscall fails.
pub fn mount_overlay(config: &OverlayConfig) -> Result<()> {
    ensure_dir(&config.upper_dir)?;
    ensure_dir(&config.work_dir)?;
    ensure_dir(&config.merged_dir)?;

    let opts = config.options();
    mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| ChamberError::Mount {
        target: config.merged_dir.clone(),
        message: format!("overlay mount: {e}"),
    })?;

    tracing::info!(merged = %config.merged_dir.display(), "overlayfs mounted");
    Ok(())
}

/// Builds a throwaway root for `lower` under `scratch`.
///
/// `scratch` gets its own tmpfs first so the upper layer never touches
/// persistent storage. Returns the merged directory to use as the root.
///
/// # Errors
///
/// Returns an error if the tmpfs or the overlay mount fails.
pub fn volatile_root(lower: &Path, scratch: &Path) -> Result<PathBuf> {
    ensure_dir(scratch)?;
    mount_fs(
        "tmpfs",
        scratch,
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=0755"),
    )?;
    let config = OverlayConfig::over(lower, scratch);
    if let Err(e) = mount_overlay(&config) {
        let _ = unmount(scratch, true);
        return Err(e);
    }
    Ok(config.merged_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_lays_out_scratch_directories() {
        let config = OverlayConfig::over(Path::new("/srv/debian"), Path::new("/var/lib/chamber/volatile/deb"));
        assert_eq!(config.upper_dir, PathBuf::from("/var/lib/chamber/volatile/deb/upper"));
        assert_eq!(config.work_dir, PathBuf::from("/var/lib/chamber/volatile/deb/work"));
        assert_eq!(config.merged_dir, PathBuf::from("/var/lib/chamber/volatile/deb/merged"));
    }

    #[test]
    fn options_join_lower_layers() {
        let config = OverlayConfig {
            lower_dirs: vec![PathBuf::from("/a"), PathBuf::from("/b")],
            upper_dir: PathBuf::from("/u"),
            work_dir: PathBuf::from("/w"),
            merged_dir: PathBuf::from("/m"),
        };
        assert_eq!(config.options(), "lowerdir=/a:/b,upperdir=/u,workdir=/w");
    }
}
