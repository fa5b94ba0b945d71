//! Filesystem management for container isolation.
//!
//! Provides mount utilities, `/dev` construction, image loop mounts,
//! volatile `OverlayFS` roots, and `pivot_root` for switching into the
//! container's root filesystem.

pub mod devices;
pub mod image;
pub mod mount;
pub mod overlayfs;
pub mod pivot_root;
