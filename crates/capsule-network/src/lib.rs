//! # capsule-network
//!
//! Container networking for the capsule runtime.
//!
//! - **IPAM**: per-subnet allocation bitmaps persisted in one JSON file.
//! - **Bridge driver**: bridge and veth devices over rtnetlink, with a
//!   masquerade rule per network.
//! - **Configurator**: moves the container end of a veth pair into the
//!   container's network namespace and publishes ports with DNAT rules.
//! - **Registry**: persisted networks and the connect/disconnect flow that
//!   ties the pieces together.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bridge;
pub mod configurator;
pub mod driver;
pub mod firewall;
pub mod ipam;
pub mod netlink;
pub mod registry;

pub use driver::{Endpoint, Network, NetworkDriver};
pub use ipam::Ipam;
pub use registry::NetworkRegistry;
