//! # capsule
//!
//! Minimal container runtime: isolated, resource-bounded processes with
//! bridge networking, managed from a single binary.

#![allow(clippy::print_stdout)]

mod commands;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use capsule_runtime::exec::ExecRequest;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    // An exec re-invocation must join namespaces while still single-threaded,
    // so it is handled before anything else runs.
    if let Some(request) = ExecRequest::from_env().map_err(|e| anyhow::anyhow!("{e}"))? {
        init_tracing(false);
        let code = request.run().map_err(|e| anyhow::anyhow!("{e}"))?;
        std::process::exit(code);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_json);
    commands::execute(cli)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
