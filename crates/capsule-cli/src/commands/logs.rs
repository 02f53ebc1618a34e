//! `capsule logs`: print a container's log.

use clap::Args;

use capsule_common::config::RuntimeConfig;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container name.
    pub container: String,

    /// Only print the last N lines.
    #[arg(long)]
    pub tail: Option<usize>,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or its log is unreadable.
pub fn execute(args: &LogsArgs, config: RuntimeConfig) -> anyhow::Result<()> {
    let engine = super::open_engine(config)?;
    let logs = engine
        .logs(&args.container, args.tail)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    print!("{logs}");
    Ok(())
}
