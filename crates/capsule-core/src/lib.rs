//! # capsule-core
//!
//! Low-level Linux isolation primitives for the capsule runtime.
//!
//! This crate provides safe abstractions over:
//! - **Cgroups**: mount table discovery plus cpuset, memory and cpu
//!   controller adapters behind a fan-out manager (v1 and v2).
//! - **Namespaces**: clone flags, user id maps, `setns` joins and a scoped
//!   network namespace context.
//! - **Filesystem**: `pivot_root`, the init-time `/proc` and `/dev` mounts,
//!   bind mounts and `OverlayFS`.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, unsafe_code))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
