//! Linux bridge driver.
//!
//! A network is one bridge device carrying the gateway address plus a
//! masquerade rule for its subnet. Each endpoint is a veth pair whose host
//! end is enslaved to the bridge.

use capsule_common::constants::BRIDGE_DRIVER;
use capsule_common::error::Result;
use ipnetwork::Ipv4Network;

use crate::driver::{Endpoint, Network, NetworkDriver};
use crate::firewall::{Iptables, NatRule};
use crate::netlink::NetlinkHandle;

/// Driver backed by kernel bridge devices.
#[derive(Debug, Clone, Default)]
pub struct BridgeDriver {
    iptables: Iptables,
}

impl BridgeDriver {
    /// Creates a driver using the given iptables runner.
    #[must_use]
    pub const fn new(iptables: Iptables) -> Self {
        Self { iptables }
    }

    /// Creates the bridge (unless present), assigns the gateway and brings
    /// it up.
    fn init_bridge(&self, network: &Network) -> Result<()> {
        let mut nl = NetlinkHandle::new()?;
        let name = &network.name;
        if nl.link_index(name)?.is_some() {
            tracing::info!(bridge = %name, "bridge already exists");
        } else {
            nl.create_bridge(name)?;
            tracing::info!(bridge = %name, "bridge created");
        }
        let index = nl.require_link(name)?;
        nl.add_address(index, network.ip_range)?;
        nl.set_link_up(index)?;
        self.iptables
            .ensure(&NatRule::masquerade(&network.ip_range, name))?;
        Ok(())
    }
}

impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &str {
        BRIDGE_DRIVER
    }

    fn create(&self, ip_range: Ipv4Network, name: &str) -> Result<Network> {
        let network = Network {
            name: name.to_string(),
            ip_range,
            driver: self.name().to_string(),
        };
        self.init_bridge(&network)?;
        Ok(network)
    }

    fn delete(&self, network: &Network) -> Result<()> {
        if let Err(e) = self
            .iptables
            .remove(&NatRule::masquerade(&network.ip_range, &network.name))
        {
            tracing::warn!(network = %network.name, error = %e, "masquerade rule not removed");
        }
        let mut nl = NetlinkHandle::new()?;
        match nl.link_index(&network.name)? {
            Some(index) => {
                nl.delete_link(index)?;
                tracing::info!(bridge = %network.name, "bridge deleted");
            }
            None => tracing::debug!(bridge = %network.name, "bridge already gone"),
        }
        Ok(())
    }

    fn connect(&self, network: &Network, endpoint: &mut Endpoint) -> Result<()> {
        let mut nl = NetlinkHandle::new()?;
        let bridge = nl.require_link(&network.name)?;
        nl.create_veth(&endpoint.device_name, &endpoint.peer_name, Some(bridge))?;
        let host_end = nl.require_link(&endpoint.device_name)?;
        nl.set_link_up(host_end)?;
        tracing::info!(
            bridge = %network.name,
            veth = %endpoint.device_name,
            peer = %endpoint.peer_name,
            "veth pair attached"
        );
        Ok(())
    }

    fn disconnect(&self, network: &Network, endpoint: &Endpoint) -> Result<()> {
        let mut nl = NetlinkHandle::new()?;
        // Deleting either end removes the pair; the container end may already
        // have vanished together with its namespace.
        if let Some(index) = nl.link_index(&endpoint.device_name)? {
            nl.delete_link(index)?;
            tracing::info!(bridge = %network.name, veth = %endpoint.device_name, "veth pair removed");
        }
        Ok(())
    }
}
