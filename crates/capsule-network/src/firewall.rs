//! iptables NAT rules for bridges and published ports.
//!
//! Rules are described as argument vectors without the action flag, so the
//! same description serves the existence check (`-C`), insertion (`-A`) and
//! removal (`-D`). Insertion is skipped when the rule is already present.

use std::fmt;
use std::net::Ipv4Addr;
use std::process::Command;
use std::str::FromStr;

use capsule_common::error::{CapsuleError, Result};
use ipnetwork::Ipv4Network;

/// One NAT rule: table, chain and match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    /// Built-in chain the rule lives in.
    pub chain: &'static str,
    /// Match and target arguments.
    pub spec: Vec<String>,
}

impl NatRule {
    /// Source NAT for traffic leaving `subnet` through anything but `bridge`.
    #[must_use]
    pub fn masquerade(subnet: &Ipv4Network, bridge: &str) -> Self {
        let subnet = Ipv4Network::new(subnet.network(), subnet.prefix()).unwrap_or(*subnet);
        Self {
            chain: "POSTROUTING",
            spec: ["-s", subnet.to_string().as_str(), "!", "-o", bridge, "-j", "MASQUERADE"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Destination NAT from a host TCP port to a container address.
    #[must_use]
    pub fn port_forward(mapping: PortMapping, container_ip: Ipv4Addr) -> Self {
        Self {
            chain: "PREROUTING",
            spec: vec![
                "-p".to_string(),
                "tcp".into(),
                "-m".into(),
                "tcp".into(),
                "--dport".into(),
                mapping.host.to_string(),
                "-j".into(),
                "DNAT".into(),
                "--to-destination".into(),
                format!("{container_ip}:{}", mapping.container),
            ],
        }
    }

    /// Full argument vector for `action` (`-A`, `-C` or `-D`).
    #[must_use]
    pub fn args(&self, action: &str) -> Vec<String> {
        let mut args = vec!["-t".to_string(), "nat".into(), action.into(), self.chain.into()];
        args.extend(self.spec.iter().cloned());
        args
    }
}

/// A published port, `hostPort:containerPort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    /// Port on the host.
    pub host: u16,
    /// Port inside the container.
    pub container: u16,
}

impl FromStr for PortMapping {
    type Err = CapsuleError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CapsuleError::Config {
            message: format!("port mapping {s:?} is not hostPort:containerPort"),
        };
        let (host, container) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            host: host.trim().parse().map_err(|_| invalid())?,
            container: container.trim().parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// Parses every mapping, logging and dropping malformed ones.
#[must_use]
pub fn parse_port_mappings(raw: &[String]) -> Vec<PortMapping> {
    raw.iter()
        .filter_map(|m| match m.parse() {
            Ok(mapping) => Some(mapping),
            Err(e) => {
                tracing::warn!(mapping = %m, error = %e, "skipping port mapping");
                None
            }
        })
        .collect()
}

/// Runs the `iptables` binary.
#[derive(Debug, Clone)]
pub struct Iptables {
    program: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl Iptables {
    /// Uses `program` as the iptables executable.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Adds `rule` unless an identical rule exists.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Firewall`] if iptables cannot be run or
    /// rejects the rule.
    pub fn ensure(&self, rule: &NatRule) -> Result<()> {
        if self.exists(rule) {
            tracing::debug!(chain = rule.chain, rule = ?rule.spec, "iptables rule already present");
            return Ok(());
        }
        self.run(&rule.args("-A"))?;
        tracing::info!(chain = rule.chain, rule = ?rule.spec, "iptables rule added");
        Ok(())
    }

    /// Deletes `rule` if present.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Firewall`] if the deletion itself fails.
    pub fn remove(&self, rule: &NatRule) -> Result<()> {
        if !self.exists(rule) {
            return Ok(());
        }
        self.run(&rule.args("-D"))?;
        tracing::info!(chain = rule.chain, rule = ?rule.spec, "iptables rule removed");
        Ok(())
    }

    fn exists(&self, rule: &NatRule) -> bool {
        self.run(&rule.args("-C")).is_ok()
    }

    fn run(&self, args: &[String]) -> Result<()> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| CapsuleError::Firewall {
                message: format!("failed to run {}: {e}", self.program),
            })?;
        if !output.status.success() {
            return Err(CapsuleError::Firewall {
                message: format!(
                    "{} {} failed: {}",
                    self.program,
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masquerade_rule_args() {
        let subnet: Ipv4Network = "10.0.0.1/24".parse().expect("cidr");
        let rule = NatRule::masquerade(&subnet, "netA");
        assert_eq!(
            rule.args("-A").join(" "),
            "-t nat -A POSTROUTING -s 10.0.0.0/24 ! -o netA -j MASQUERADE"
        );
    }

    #[test]
    fn port_forward_rule_args() {
        let rule = NatRule::port_forward(
            PortMapping {
                host: 8080,
                container: 80,
            },
            Ipv4Addr::new(10, 0, 0, 2),
        );
        assert_eq!(
            rule.args("-D").join(" "),
            "-t nat -D PREROUTING -p tcp -m tcp --dport 8080 -j DNAT --to-destination 10.0.0.2:80"
        );
    }

    #[test]
    fn port_mapping_parses() {
        let m: PortMapping = "8080:80".parse().expect("parse");
        assert_eq!(m, PortMapping { host: 8080, container: 80 });
        assert_eq!(m.to_string(), "8080:80");
    }

    #[test]
    fn malformed_mappings_are_skipped() {
        let raw = vec![
            "80".to_string(),
            "a:b".into(),
            "70000:80".into(),
            "443:8443".into(),
        ];
        assert_eq!(
            parse_port_mappings(&raw),
            vec![PortMapping {
                host: 443,
                container: 8443
            }]
        );
    }

    #[test]
    fn missing_binary_is_firewall_error() {
        let fw = Iptables::new("/nonexistent/iptables");
        let rule = NatRule::masquerade(&"10.0.0.0/24".parse().expect("cidr"), "br0");
        let err = fw.ensure(&rule).expect_err("no binary");
        assert!(matches!(err, CapsuleError::Firewall { .. }));
        // Removal of a rule that cannot be checked is a no-op.
        fw.remove(&rule).expect("remove");
    }
}
