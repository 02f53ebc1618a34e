//! # capsule-common
//!
//! Shared types, error definitions, configuration, constants and the
//! locked JSON store used across the capsule workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod store;
pub mod types;
