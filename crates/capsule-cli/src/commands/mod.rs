//! CLI command definitions and dispatch.

pub mod exec;
pub mod init;
pub mod logs;
pub mod network;
pub mod ps;
pub mod rm;
pub mod run;
pub mod stop;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use capsule_common::config::RuntimeConfig;
use capsule_runtime::Engine;

/// Minimal container runtime.
#[derive(Parser, Debug)]
#[command(name = "capsule", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Keep all runtime state under this directory instead of the defaults.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and start a container.
    Run(run::RunArgs),
    /// Container init process. Not for direct use.
    #[command(hide = true)]
    Init,
    /// Execute a command inside a running container.
    Exec(exec::ExecArgs),
    /// List containers.
    Ps(ps::PsArgs),
    /// Print a container's log.
    Logs(logs::LogsArgs),
    /// Stop running containers.
    Stop(stop::StopArgs),
    /// Remove stopped containers.
    Rm(rm::RmArgs),
    /// Manage container networks.
    Network(network::NetworkArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = runtime_config(cli.root.as_deref());
    match cli.command {
        Command::Run(args) => run::execute(args, config),
        Command::Init => init::execute(),
        Command::Exec(args) => exec::execute(args, config),
        Command::Ps(args) => ps::execute(&args, config),
        Command::Logs(args) => logs::execute(&args, config),
        Command::Stop(args) => stop::execute(&args, config),
        Command::Rm(args) => rm::execute(&args, config),
        Command::Network(args) => network::execute(args, config),
    }
}

fn runtime_config(root: Option<&std::path::Path>) -> RuntimeConfig {
    root.map_or_else(RuntimeConfig::default, RuntimeConfig::with_root)
}

/// Opens the engine over the configured state directories.
///
/// # Errors
///
/// Returns an error if persisted networks cannot be loaded.
pub fn open_engine(config: RuntimeConfig) -> anyhow::Result<Engine> {
    Engine::new(config).map_err(|e| anyhow::anyhow!("{e}"))
}
