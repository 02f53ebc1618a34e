//! `capsule network`: manage container networks.

use clap::{Args, Subcommand};

use capsule_common::config::RuntimeConfig;
use capsule_common::constants::BRIDGE_DRIVER;

use crate::output;

/// Arguments for the `network` command.
#[derive(Args, Debug)]
pub struct NetworkArgs {
    /// Network operation.
    #[command(subcommand)]
    pub command: NetworkCommand,
}

/// Network operations.
#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Create a network and its gateway.
    Create {
        /// Network driver.
        #[arg(long, default_value = BRIDGE_DRIVER)]
        driver: String,
        /// Subnet in CIDR notation, e.g. `192.168.10.0/24`.
        #[arg(long)]
        subnet: String,
        /// Network name; also the bridge device name.
        name: String,
    },
    /// List networks.
    #[command(alias = "ls")]
    List,
    /// Remove a network.
    #[command(alias = "rm")]
    Remove {
        /// Network name.
        name: String,
    },
}

/// Executes the `network` command.
///
/// # Errors
///
/// Returns an error if the network operation fails.
pub fn execute(args: NetworkArgs, config: RuntimeConfig) -> anyhow::Result<()> {
    let mut engine = super::open_engine(config)?;
    match args.command {
        NetworkCommand::Create {
            driver,
            subnet,
            name,
        } => {
            let network = engine
                .create_network(&driver, &subnet, &name)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            output::status_line("created", &network.name);
        }
        NetworkCommand::List => {
            println!("{}", output::NETWORK_HEADER);
            for network in engine.networks() {
                println!("{}", output::network_row(&network));
            }
        }
        NetworkCommand::Remove { name } => {
            engine
                .remove_network(&name)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            output::status_line("removed", &name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Command};

    fn parse(args: &[&str]) -> NetworkCommand {
        match Cli::try_parse_from(args).expect("parse").command {
            Command::Network(args) => args.command,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn create_defaults_to_bridge() {
        let command = parse(&["capsule", "network", "create", "--subnet", "10.0.0.0/24", "br0"]);
        match command {
            NetworkCommand::Create {
                driver,
                subnet,
                name,
            } => {
                assert_eq!(driver, "bridge");
                assert_eq!(subnet, "10.0.0.0/24");
                assert_eq!(name, "br0");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn create_requires_subnet() {
        assert!(Cli::try_parse_from(["capsule", "network", "create", "br0"]).is_err());
    }

    #[test]
    fn short_aliases_resolve() {
        assert!(matches!(parse(&["capsule", "network", "ls"]), NetworkCommand::List));
        assert!(matches!(
            parse(&["capsule", "network", "rm", "br0"]),
            NetworkCommand::Remove { name } if name == "br0"
        ));
    }
}
