//! `capsule rm`: remove containers that are no longer running.

use clap::Args;

use capsule_common::config::RuntimeConfig;

use crate::output;

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Names of the containers to remove.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

/// Executes the `rm` command.
///
/// # Errors
///
/// Returns an error if any container is still running or could not be
/// removed.
pub fn execute(args: &RmArgs, config: RuntimeConfig) -> anyhow::Result<()> {
    let engine = super::open_engine(config)?;
    let mut first_error = None;
    for name in &args.containers {
        match engine.remove(name) {
            Ok(info) => output::status_line("removed", &info.name),
            Err(e) => {
                tracing::error!(container = %name, error = %e, "remove failed");
                let _ = first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), |e| Err(anyhow::anyhow!("{e}")))
}
