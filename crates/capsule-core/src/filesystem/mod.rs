//! Filesystem management for container isolation.
//!
//! Provides `OverlayFS` workspace mounts, `pivot_root` for switching into
//! the container root, and the pseudo-filesystem mounts done by init.

pub mod mount;
pub mod overlayfs;
pub mod pivot_root;
