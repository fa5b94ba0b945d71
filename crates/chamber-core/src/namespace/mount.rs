//! Mount namespace isolation.
//!
//! A fresh mount namespace still shares propagation with the host until
//! the root is made private.

use chamber_common::error::{ChamberError, Result};
use nix::mount::{MsFlags, mount};

/// Marks every mount in the current namespace as private, recursively.
///
/// Must run before any container mount so no mount event leaks back to
/// the host.
///
/// # Errors
///
/// Returns an error if the propagation change is refused.
pub fn make_root_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| ChamberError::Mount {
        target: "/".into(),
        message: format!("make private: {e}"),
    })?;
    tracing::debug!("root mount propagation set to private");
    Ok(())
}
