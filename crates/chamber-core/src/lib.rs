//! # chamber-core
//!
//! Low-level Linux isolation primitives for the chamber runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: mount, UTS, IPC and PID creation and joining.
//! - **Filesystem**: mount helpers, `/dev` construction, image loop mounts,
//!   volatile `OverlayFS` roots and `pivot_root`.
//! - **Cgroups**: compatibility mounts for guest init systems.
//! - **Pseudo-terminals**: console and TTY pair allocation.
//! - **procfs**: the small set of `/proc` readers the runtime needs.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("chamber-core requires a Linux or Android kernel");

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod procfs;
pub mod pty;
