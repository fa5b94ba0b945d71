//! Container lifecycle management for the chamber runtime.
//!
//! [`engine::Engine`] is the entry point used by the CLI. It boots guests
//! through [`bootstrap`], finds their init with [`discovery`], persists
//! records in [`state`] and stops them through [`lifecycle`].

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bootstrap;
pub mod console;
pub mod discovery;
pub mod engine;
pub mod exec;
pub mod lifecycle;
pub mod logs;
pub mod network;
pub mod process;
pub mod requirements;
pub mod shutdown;
pub mod state;
