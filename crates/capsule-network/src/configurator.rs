//! Wiring an endpoint into a running container.
//!
//! The container end of the veth pair is moved into the container's network
//! namespace and configured from inside it; published ports become DNAT
//! rules on the host.

use std::fmt;
use std::os::fd::AsRawFd;

use capsule_common::error::Result;
use capsule_core::namespace::network::{open_netns, run_in_netns};

use crate::driver::Endpoint;
use crate::firewall::{Iptables, NatRule, PortMapping, parse_port_mappings};
use crate::netlink::NetlinkHandle;

/// Per-container network setup performed after the driver attached the
/// endpoint.
pub trait EndpointConfigurator: fmt::Debug + Send + Sync {
    /// Moves the container end into `pid`'s namespace and gives it the
    /// endpoint address, loopback and a default route via the gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be entered or any link,
    /// address or route request fails.
    fn configure_namespace(&self, endpoint: &Endpoint, pid: i32) -> Result<()>;

    /// Installs one DNAT rule per well-formed port mapping.
    ///
    /// Malformed mappings are skipped. On failure, rules already added for
    /// this endpoint are removed again.
    ///
    /// # Errors
    ///
    /// Returns an error if a rule cannot be installed.
    fn publish_ports(&self, endpoint: &Endpoint) -> Result<Vec<PortMapping>>;

    /// Removes the DNAT rules of an endpoint, best effort.
    fn unpublish_ports(&self, endpoint: &Endpoint);
}

/// Configurator using rtnetlink inside the target namespace and iptables
/// on the host.
#[derive(Debug, Clone, Default)]
pub struct NetnsConfigurator {
    iptables: Iptables,
}

impl NetnsConfigurator {
    /// Creates a configurator using the given iptables runner.
    #[must_use]
    pub const fn new(iptables: Iptables) -> Self {
        Self { iptables }
    }
}

impl EndpointConfigurator for NetnsConfigurator {
    fn configure_namespace(&self, endpoint: &Endpoint, pid: i32) -> Result<()> {
        let netns = open_netns(pid)?;
        {
            let mut host = NetlinkHandle::new()?;
            let peer = host.require_link(&endpoint.peer_name)?;
            host.set_link_netns(peer, netns.as_raw_fd())?;
        }

        let address = endpoint.address_with_prefix();
        let gateway = endpoint.network.gateway();
        let peer_name = endpoint.peer_name.as_str();
        run_in_netns(pid, || {
            let mut nl = NetlinkHandle::new()?;
            let index = nl.require_link(peer_name)?;
            nl.add_address(index, address)?;
            nl.set_link_up(index)?;
            if let Some(lo) = nl.link_index("lo")? {
                nl.set_link_up(lo)?;
            }
            nl.add_default_route(gateway, index)?;
            Ok(())
        })?;

        tracing::info!(
            pid,
            interface = %endpoint.peer_name,
            ip = %address,
            gateway = %gateway,
            "container network configured"
        );
        Ok(())
    }

    fn publish_ports(&self, endpoint: &Endpoint) -> Result<Vec<PortMapping>> {
        let mappings = parse_port_mappings(&endpoint.port_mapping);
        let mut installed: Vec<NatRule> = Vec::with_capacity(mappings.len());
        for mapping in &mappings {
            let rule = NatRule::port_forward(*mapping, endpoint.ip_address);
            if let Err(e) = self.iptables.ensure(&rule) {
                for done in installed.iter().rev() {
                    if let Err(undo) = self.iptables.remove(done) {
                        tracing::warn!(error = %undo, "port rule rollback failed");
                    }
                }
                return Err(e);
            }
            installed.push(rule);
        }
        Ok(mappings)
    }

    fn unpublish_ports(&self, endpoint: &Endpoint) {
        for mapping in parse_port_mappings(&endpoint.port_mapping) {
            let rule = NatRule::port_forward(mapping, endpoint.ip_address);
            if let Err(e) = self.iptables.remove(&rule) {
                tracing::warn!(mapping = %mapping, error = %e, "port rule not removed");
            }
        }
    }
}
