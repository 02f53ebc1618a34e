//! `capsule ps`: list containers.

use clap::Args;

use capsule_common::config::RuntimeConfig;
use capsule_common::types::ContainerState;

use crate::output;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Only list running containers.
    #[arg(short, long)]
    pub running: bool,

    /// Only print container names.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Executes the `ps` command.
///
/// Containers whose process has gone away are reported as exited.
///
/// # Errors
///
/// Returns an error if the container records cannot be read.
pub fn execute(args: &PsArgs, config: RuntimeConfig) -> anyhow::Result<()> {
    let engine = super::open_engine(config)?;
    let containers = engine.list().map_err(|e| anyhow::anyhow!("{e}"))?;
    let shown = containers
        .iter()
        .filter(|c| !args.running || c.status == ContainerState::Running);

    if args.quiet {
        for info in shown {
            println!("{}", info.name);
        }
        return Ok(());
    }

    println!("{}", output::CONTAINER_HEADER);
    for info in shown {
        println!("{}", output::container_row(info));
    }
    Ok(())
}
