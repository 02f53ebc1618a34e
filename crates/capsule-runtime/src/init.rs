//! Container init: the first code run inside the new namespaces.
//!
//! Started as `<binary> init` by the launcher with the container root as
//! its working directory. Any error here is fatal to the container; it is
//! reported on stderr, which is the container log in detached mode.

use std::convert::Infallible;
use std::ffi::CString;

use capsule_common::error::{CapsuleError, Result};
use capsule_core::filesystem::pivot_root::pivot_root;

use crate::process::read_command;

/// Reads the command, switches root (mounting `/proc` and `/dev` on the
/// way) and replaces the process image with the user's program.
///
/// Only returns on failure.
///
/// # Errors
///
/// Returns an error if the pipe yields no command, the root switch or a
/// mount is refused, the program cannot be found on `PATH`, or `execv`
/// fails.
pub fn run_container_init() -> Result<Infallible> {
    let command = read_command()?;
    tracing::info!(command = ?command, "container init received command");

    let root = std::env::current_dir().map_err(|e| CapsuleError::io(".", e))?;
    pivot_root(&root)?;

    let program = which::which(&command[0]).map_err(|e| CapsuleError::NotFound {
        kind: "executable",
        id: format!("{}: {e}", command[0]),
    })?;
    tracing::info!(program = %program.display(), "executing container command");

    let path = to_cstring(&program.to_string_lossy())?;
    let argv = command
        .iter()
        .map(|a| to_cstring(a))
        .collect::<Result<Vec<_>>>()?;
    nix::unistd::execv(&path, &argv).map_err(|e| CapsuleError::PermissionDenied {
        message: format!("execv {} failed: {e}", program.display()),
    })
}

fn to_cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| CapsuleError::Config {
        message: format!("argument {value:?} contains a NUL byte"),
    })
}
