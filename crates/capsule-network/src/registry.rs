//! Persisted networks and the operations that span IPAM, driver and
//! configurator.
//!
//! The registry is loaded from the network directory when constructed and
//! handed to whoever needs it; there is no process-wide network table.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use capsule_common::config::RuntimeConfig;
use capsule_common::constants::MAX_IFNAME_LEN;
use capsule_common::error::{CapsuleError, Result};
use capsule_common::store;
use capsule_common::types::ContainerInfo;
use ipnetwork::Ipv4Network;

use crate::bridge::BridgeDriver;
use crate::configurator::{EndpointConfigurator, NetnsConfigurator};
use crate::driver::{Endpoint, Network, NetworkDriver};
use crate::ipam::Ipam;

/// Loaded networks plus the components that act on them.
#[derive(Debug)]
pub struct NetworkRegistry {
    dir: PathBuf,
    ipam: Ipam,
    drivers: HashMap<String, Box<dyn NetworkDriver>>,
    configurator: Box<dyn EndpointConfigurator>,
    networks: BTreeMap<String, Network>,
}

impl NetworkRegistry {
    /// Loads the registry with the bridge driver and namespace configurator.
    ///
    /// # Errors
    ///
    /// Returns an error if the network directory cannot be read.
    pub fn load(config: &RuntimeConfig) -> Result<Self> {
        Self::with_components(
            &config.network_dir,
            Ipam::new(&config.ipam_file),
            vec![Box::new(BridgeDriver::default())],
            Box::new(NetnsConfigurator::default()),
        )
    }

    /// Loads the registry with explicit components.
    ///
    /// # Errors
    ///
    /// Returns an error if the network directory cannot be read or holds
    /// a malformed record.
    pub fn with_components(
        dir: impl Into<PathBuf>,
        ipam: Ipam,
        drivers: Vec<Box<dyn NetworkDriver>>,
        configurator: Box<dyn EndpointConfigurator>,
    ) -> Result<Self> {
        let dir = dir.into();
        let networks = load_networks(&dir)?;
        tracing::debug!(dir = %dir.display(), count = networks.len(), "networks loaded");
        Ok(Self {
            dir,
            ipam,
            drivers: drivers
                .into_iter()
                .map(|d| (d.name().to_string(), d))
                .collect(),
            configurator,
            networks,
        })
    }

    /// All networks, ordered by name.
    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    /// Looks up a network by name.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if no such network exists.
    pub fn get(&self, name: &str) -> Result<&Network> {
        self.networks.get(name).ok_or_else(|| CapsuleError::NotFound {
            kind: "network",
            id: name.to_string(),
        })
    }

    /// The allocator backing this registry.
    #[must_use]
    pub const fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    /// Creates and persists a network.
    ///
    /// The gateway is the first address allocated from `subnet`. An existing
    /// network of the same name is refused before anything is allocated.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::AlreadyExists`] for a duplicate name,
    /// [`CapsuleError::Config`] for a bad name, driver or subnet, or the
    /// driver's error (after releasing the gateway).
    pub fn create_network(&mut self, driver: &str, subnet: &str, name: &str) -> Result<Network> {
        validate_name(name)?;
        let driver = self.driver(driver)?;
        let subnet: Ipv4Network = subnet.parse().map_err(|e| CapsuleError::Config {
            message: format!("invalid subnet {subnet:?}: {e}"),
        })?;

        let path = self.dir.join(name);
        let _lock = store::lock_exclusive(&path)?;
        if self.networks.contains_key(name) || path.exists() {
            return Err(CapsuleError::AlreadyExists {
                kind: "network",
                id: name.to_string(),
            });
        }

        let gateway = self.ipam.allocate(&subnet)?;
        let ip_range = Ipv4Network::new(gateway, subnet.prefix()).map_err(|e| {
            CapsuleError::Config {
                message: format!("invalid gateway {gateway}/{}: {e}", subnet.prefix()),
            }
        })?;

        let network = match driver.create(ip_range, name) {
            Ok(network) => network,
            Err(e) => {
                self.release_quietly(&subnet, gateway);
                return Err(e);
            }
        };
        if let Err(e) = store::write_json(&path, &network) {
            if let Err(undo) = driver.delete(&network) {
                tracing::warn!(network = %name, error = %undo, "driver rollback failed");
            }
            self.release_quietly(&subnet, gateway);
            return Err(e);
        }

        tracing::info!(network = %name, gateway = %gateway, driver = driver.name(), "network created");
        let _ = self.networks.insert(name.to_string(), network.clone());
        Ok(network)
    }

    /// Releases the gateway, tears down the driver side and deletes the
    /// record.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown network or the
    /// first failing step's error.
    pub fn delete_network(&mut self, name: &str) -> Result<()> {
        let network = self.get(name)?.clone();
        let path = self.dir.join(name);
        let _lock = store::lock_exclusive(&path)?;

        self.ipam.release(&network.subnet(), network.gateway())?;
        self.driver(&network.driver)?.delete(&network)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CapsuleError::io(&path, e)),
        }
        let _ = self.networks.remove(name);
        tracing::info!(network = %name, "network removed");
        Ok(())
    }

    /// Attaches a running container to network `name`.
    ///
    /// Allocates an address, lets the driver create the link pair,
    /// configures the container's namespace and publishes its ports. A
    /// failing stage undoes the stages before it.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::InvalidState`] if the container has no pid,
    /// otherwise the failing stage's error.
    pub fn connect(&self, name: &str, info: &ContainerInfo) -> Result<Endpoint> {
        let network = self.get(name)?.clone();
        let pid = info.host_pid().ok_or_else(|| CapsuleError::InvalidState {
            message: format!("container {} has no running process", info.name),
        })?;
        let driver = self.driver(&network.driver)?;

        let subnet = network.subnet();
        let ip = self.ipam.allocate(&subnet)?;
        let mut endpoint = Endpoint::new(info.id.as_str(), network, ip, info.port_mapping.clone());

        let attached = endpoint.network.clone();
        if let Err(e) = driver.connect(&attached, &mut endpoint) {
            self.release_quietly(&subnet, ip);
            return Err(e);
        }
        if let Err(e) = self.configurator.configure_namespace(&endpoint, pid) {
            self.disconnect_quietly(driver, &endpoint);
            self.release_quietly(&subnet, ip);
            return Err(e);
        }
        if let Err(e) = self.configurator.publish_ports(&endpoint) {
            self.disconnect_quietly(driver, &endpoint);
            self.release_quietly(&subnet, ip);
            return Err(e);
        }

        tracing::info!(
            container = %info.name,
            network = %name,
            ip = %ip,
            "container connected"
        );
        Ok(endpoint)
    }

    /// Undoes [`Self::connect`] for a container record carrying `ip`.
    ///
    /// Removes port rules, the link pair and the address reservation. Each
    /// step is attempted even if an earlier one failed; the first error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown network, or the
    /// first failing step's error.
    pub fn disconnect(&self, name: &str, info: &ContainerInfo, ip: Ipv4Addr) -> Result<()> {
        let network = self.get(name)?.clone();
        let driver = self.driver(&network.driver)?;
        let subnet = network.subnet();
        let endpoint = Endpoint::new(info.id.as_str(), network, ip, info.port_mapping.clone());

        self.configurator.unpublish_ports(&endpoint);
        let unlinked = driver.disconnect(&endpoint.network, &endpoint);
        let released = self.ipam.release(&subnet, ip);
        unlinked.and(released)?;
        tracing::info!(container = %info.name, network = %name, ip = %ip, "container disconnected");
        Ok(())
    }

    fn driver(&self, name: &str) -> Result<&dyn NetworkDriver> {
        self.drivers
            .get(name)
            .map(|d| &**d)
            .ok_or_else(|| CapsuleError::Config {
                message: format!("unknown network driver {name:?}"),
            })
    }

    fn release_quietly(&self, subnet: &Ipv4Network, ip: Ipv4Addr) {
        if let Err(e) = self.ipam.release(subnet, ip) {
            tracing::warn!(subnet = %subnet, ip = %ip, error = %e, "address rollback failed");
        }
    }

    fn disconnect_quietly(&self, driver: &dyn NetworkDriver, endpoint: &Endpoint) {
        self.configurator.unpublish_ports(endpoint);
        if let Err(e) = driver.disconnect(&endpoint.network, endpoint) {
            tracing::warn!(endpoint = %endpoint.id, error = %e, "link rollback failed");
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = |why: &str| CapsuleError::Config {
        message: format!("invalid network name {name:?}: {why}"),
    };
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_IFNAME_LEN {
        return Err(invalid("longer than the interface name limit"));
    }
    if name.starts_with('.') || name.contains(['/', ':']) || name.contains(char::is_whitespace) {
        return Err(invalid("not usable as a device name"));
    }
    Ok(())
}

fn load_networks(dir: &Path) -> Result<BTreeMap<String, Network>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(CapsuleError::io(dir, e)),
    };
    let mut networks = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|e| CapsuleError::io(dir, e))?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with('.') || !entry.path().is_file() {
            continue;
        }
        if let Some(network) = store::read_json::<Network>(&entry.path())? {
            let _ = networks.insert(network.name.clone(), network);
        }
    }
    Ok(networks)
}
