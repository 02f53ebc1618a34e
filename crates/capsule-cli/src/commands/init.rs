//! `capsule init`: first process inside a new container.

use capsule_runtime::init::run_container_init;

/// Executes the hidden `init` command.
///
/// Only returns on failure; on success the process image is replaced by
/// the container command.
///
/// # Errors
///
/// Returns the error that prevented the container command from starting.
pub fn execute() -> anyhow::Result<()> {
    match run_container_init() {
        Ok(never) => match never {},
        Err(e) => {
            tracing::error!(error = %e, "container init failed");
            Err(anyhow::anyhow!("{e}"))
        }
    }
}
