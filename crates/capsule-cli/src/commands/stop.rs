//! `capsule stop`: stop running containers.

use clap::Args;

use capsule_common::config::RuntimeConfig;

use crate::output;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Names of the containers to stop.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

/// Executes the `stop` command.
///
/// Sends SIGTERM without waiting for the process to exit. Every name is
/// attempted; the first failure is reported after all of them.
///
/// # Errors
///
/// Returns an error if any container could not be stopped.
pub fn execute(args: &StopArgs, config: RuntimeConfig) -> anyhow::Result<()> {
    let engine = super::open_engine(config)?;
    let mut first_error = None;
    for name in &args.containers {
        match engine.stop(name) {
            Ok(info) => output::status_line("stopped", &info.name),
            Err(e) => {
                tracing::error!(container = %name, error = %e, "stop failed");
                let _ = first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), |e| Err(anyhow::anyhow!("{e}")))
}
