//! `capsule exec`: run a command inside a running container.

use clap::Args;

use capsule_common::config::RuntimeConfig;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Container name.
    pub container: String,

    /// Command to execute.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `exec` command.
///
/// Joins the target container's namespaces and runs the command with the
/// terminal attached, then exits with its status.
///
/// # Errors
///
/// Returns an error if the container is not running or cannot be entered.
pub fn execute(args: ExecArgs, config: RuntimeConfig) -> anyhow::Result<()> {
    let engine = super::open_engine(config)?;
    let code = engine
        .exec(&args.container, &args.command)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    std::process::exit(code);
}
