//! # capsule-runtime
//!
//! Container lifecycle for the capsule runtime: the namespaced launcher and
//! its init handoff, exec into running containers, the on-disk container
//! registry, overlay workspaces and the [`engine::Engine`] that sequences
//! them into run, stop and remove.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod exec;
pub mod init;
pub mod logs;
pub mod process;
pub mod registry;
pub mod workspace;

pub use engine::{Engine, RunOutcome, RunRequest};
