//! Network and endpoint model plus the driver seam.

use std::fmt;
use std::net::Ipv4Addr;

use capsule_common::constants::MAX_IFNAME_LEN;
use capsule_common::error::Result;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// Characters of the endpoint id used for device names.
pub const VETH_ID_LEN: usize = 10;

/// Prefix of the container-side veth name.
pub const PEER_PREFIX: &str = "cif-";

/// A persisted logical network.
///
/// `ip_range` keeps the network's prefix but its address is the gateway,
/// which is also the address assigned to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network name; doubles as the bridge device name.
    pub name: String,
    /// Gateway address with the subnet prefix.
    pub ip_range: Ipv4Network,
    /// Name of the driver that owns the network.
    pub driver: String,
}

impl Network {
    /// Gateway address.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        self.ip_range.ip()
    }

    /// Canonical subnet (network address plus prefix).
    #[must_use]
    pub fn subnet(&self) -> Ipv4Network {
        Ipv4Network::new(self.ip_range.network(), self.ip_range.prefix()).unwrap_or(self.ip_range)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.ip_range, self.driver)
    }
}

/// A container's attachment to a network. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `<container id>-<network name>`.
    pub id: String,
    /// Host-side veth name.
    pub device_name: String,
    /// Container-side veth name.
    pub peer_name: String,
    /// Address allocated to the container.
    pub ip_address: Ipv4Addr,
    /// Network the endpoint belongs to.
    pub network: Network,
    /// Port mappings copied from the container record.
    pub port_mapping: Vec<String>,
}

impl Endpoint {
    /// Builds an endpoint with device names derived from its id.
    #[must_use]
    pub fn new(
        container_id: &str,
        network: Network,
        ip_address: Ipv4Addr,
        port_mapping: Vec<String>,
    ) -> Self {
        let id = format!("{container_id}-{}", network.name);
        let (device_name, peer_name) = veth_names(&id);
        Self {
            id,
            device_name,
            peer_name,
            ip_address,
            network,
            port_mapping,
        }
    }

    /// Container address with the network prefix.
    #[must_use]
    pub fn address_with_prefix(&self) -> Ipv4Network {
        Ipv4Network::new(self.ip_address, self.network.ip_range.prefix())
            .unwrap_or(self.network.ip_range)
    }
}

/// Host and container veth names for an endpoint id.
///
/// Both stay within the kernel's interface name limit.
#[must_use]
pub fn veth_names(endpoint_id: &str) -> (String, String) {
    let short: String = endpoint_id.chars().take(VETH_ID_LEN).collect();
    let host = short.clone();
    let peer = format!("{PEER_PREFIX}{short}");
    debug_assert!(peer.len() <= MAX_IFNAME_LEN);
    (host, peer)
}

/// Backend that realises networks and endpoints on the host.
pub trait NetworkDriver: fmt::Debug + Send + Sync {
    /// Driver name used in network records.
    fn name(&self) -> &str;

    /// Creates the host side of a network whose gateway/prefix is `ip_range`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device or its NAT rule cannot be set up.
    fn create(&self, ip_range: Ipv4Network, name: &str) -> Result<Network>;

    /// Tears down the host side of `network`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device exists but cannot be deleted.
    fn delete(&self, network: &Network) -> Result<()>;

    /// Creates the endpoint's link pair and attaches it to `network`.
    ///
    /// # Errors
    ///
    /// Returns an error if the network device is missing or link creation
    /// fails.
    fn connect(&self, network: &Network, endpoint: &mut Endpoint) -> Result<()>;

    /// Removes whatever [`Self::connect`] created, if it still exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing link cannot be deleted.
    fn disconnect(&self, network: &Network, endpoint: &Endpoint) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> Network {
        Network {
            name: "testbr".into(),
            ip_range: "10.0.0.1/24".parse().expect("cidr"),
            driver: "bridge".into(),
        }
    }

    #[test]
    fn gateway_and_subnet_split() {
        let net = network();
        assert_eq!(net.gateway(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(net.subnet().to_string(), "10.0.0.0/24");
    }

    #[test]
    fn endpoint_names_fit_interface_limit() {
        let ep = Endpoint::new("1234567890", network(), Ipv4Addr::new(10, 0, 0, 2), vec![]);
        assert_eq!(ep.id, "1234567890-testbr");
        assert_eq!(ep.device_name, "1234567890");
        assert_eq!(ep.peer_name, "cif-1234567890");
        assert!(ep.peer_name.len() <= MAX_IFNAME_LEN);
        assert_eq!(ep.address_with_prefix().to_string(), "10.0.0.2/24");
    }

    #[test]
    fn network_record_round_trips_as_json() {
        let json = serde_json::to_string(&network()).expect("serialize");
        assert!(json.contains("\"10.0.0.1/24\""));
        let back: Network = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, network());
    }
}
