//! `capsule run`: create and start a container.

use clap::Args;

use capsule_common::config::RuntimeConfig;
use capsule_common::types::ResourceConfig;
use capsule_runtime::{RunOutcome, RunRequest};

use crate::output;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Attach the terminal and wait for the container to exit.
    #[arg(short = 't', long)]
    pub tty: bool,

    /// Container name (defaults to the generated ID).
    #[arg(long)]
    pub name: Option<String>,

    /// Memory limit, e.g. `100m`.
    #[arg(short, long, default_value = "")]
    pub memory: String,

    /// CPU shares weight.
    #[arg(long, default_value = "")]
    pub cpu_share: String,

    /// CPUs the container may run on, e.g. `0-1`.
    #[arg(long, default_value = "")]
    pub cpuset: String,

    /// Bind mount, `host:container`.
    #[arg(short, long, default_value = "")]
    pub volume: String,

    /// Extra environment variable, `KEY=VALUE`.
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Network to connect the container to.
    #[arg(long)]
    pub net: Option<String>,

    /// Published port, `hostPort:containerPort`.
    #[arg(short, long = "publish")]
    pub publish: Vec<String>,

    /// Image name, looked up under `<root>/images`.
    pub image: String,

    /// Command to run inside the container.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Builds the engine request described by these arguments.
    #[must_use]
    pub fn to_request(&self) -> RunRequest {
        RunRequest {
            tty: self.tty,
            name: self.name.clone(),
            image: self.image.clone(),
            command: self.command.clone(),
            resources: ResourceConfig {
                memory_limit: self.memory.clone(),
                cpu_share: self.cpu_share.clone(),
                cpu_set: self.cpuset.clone(),
            },
            volume: self.volume.clone(),
            env: self.env.clone(),
            network: self.net.clone(),
            port_mapping: self.publish.clone(),
        }
    }
}

/// Executes the `run` command.
///
/// Detached runs print the container ID; foreground runs exit with the
/// container's exit code.
///
/// # Errors
///
/// Returns an error if any setup step fails.
pub fn execute(args: RunArgs, config: RuntimeConfig) -> anyhow::Result<()> {
    let engine = super::open_engine(config)?;
    let request = args.to_request();
    tracing::debug!(image = %request.image, tty = request.tty, "run requested");

    match engine.run(&request).map_err(|e| anyhow::anyhow!("{e}"))? {
        RunOutcome::Detached(info) => {
            output::status_line("started", &info.name);
            println!("{}", info.id);
            Ok(())
        }
        RunOutcome::Exited { info, code } => {
            tracing::info!(name = %info.name, code, "container exited");
            std::process::exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::commands::{Cli, Command};

    fn parse(args: &[&str]) -> super::RunArgs {
        match Cli::try_parse_from(args).expect("parse").command {
            Command::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_collects_repeatable_flags() {
        let args = parse(&[
            "capsule", "run", "-t", "--name", "web", "-m", "100m", "--cpuset", "0-1", "-e",
            "A=1", "-e", "B=2", "-p", "8080:80", "-p", "8443:443", "--net", "br0", "busybox",
            "top",
        ]);
        let request = args.to_request();
        assert!(request.tty);
        assert_eq!(request.name.as_deref(), Some("web"));
        assert_eq!(request.resources.memory_limit, "100m");
        assert_eq!(request.resources.cpu_set, "0-1");
        assert!(request.resources.cpu_share.is_empty());
        assert_eq!(request.env, ["A=1", "B=2"]);
        assert_eq!(request.port_mapping, ["8080:80", "8443:443"]);
        assert_eq!(request.network.as_deref(), Some("br0"));
        assert_eq!(request.image, "busybox");
        assert_eq!(request.command, ["top"]);
    }

    #[test]
    fn trailing_command_keeps_its_flags() {
        let args = parse(&["capsule", "run", "busybox", "sh", "-c", "echo hi"]);
        assert_eq!(args.command, ["sh", "-c", "echo hi"]);
        assert!(!args.tty);
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["capsule", "run", "busybox"]).is_err());
    }
}
