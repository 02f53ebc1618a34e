//! Running a command inside an existing container.
//!
//! The parent side re-executes the binary with the target pid and command
//! in the environment, extended by the target's own environment. The child
//! side is picked up by [`ExecRequest::from_env`] before CLI parsing, while
//! the process is still single-threaded, joins the container's namespaces
//! and runs the command through `/bin/sh -c`.

use std::process::Command;

use capsule_common::constants::{ENV_EXEC_CMD, ENV_EXEC_PID};
use capsule_common::error::{CapsuleError, Result};
use capsule_core::namespace::{EXEC_NAMESPACES, join_namespaces};

use crate::process::SELF_EXE;

/// Verb of the re-executed binary.
pub const EXEC_VERB: &str = "exec";

/// Shell used to interpret the command inside the container.
pub const EXEC_SHELL: &str = "/bin/sh";

/// Target pid and command passed to the re-executed binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Host pid of the container init.
    pub pid: i32,
    /// Command line handed to the shell.
    pub command: String,
}

impl ExecRequest {
    /// Reads a request from this process's environment.
    ///
    /// # Errors
    ///
    /// See [`Self::from_vars`].
    pub fn from_env() -> Result<Option<Self>> {
        let pid = std::env::var(ENV_EXEC_PID).ok();
        let command = std::env::var(ENV_EXEC_CMD).ok();
        Self::from_vars(pid.as_deref(), command.as_deref())
    }

    /// Builds a request from raw variable values.
    ///
    /// No pid variable means this is not an exec re-invocation.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] if the pid is not a positive number
    /// or the command is missing or blank.
    pub fn from_vars(pid: Option<&str>, command: Option<&str>) -> Result<Option<Self>> {
        let Some(pid) = pid.filter(|p| !p.is_empty()) else {
            return Ok(None);
        };
        let pid: i32 = pid
            .trim()
            .parse()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| CapsuleError::Config {
                message: format!("{ENV_EXEC_PID}={pid:?} is not a pid"),
            })?;
        let command = command
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CapsuleError::Config {
                message: format!("{ENV_EXEC_CMD} is missing"),
            })?;
        Ok(Some(Self {
            pid,
            command: command.to_string(),
        }))
    }

    /// Joins the container's namespaces and runs the command, returning its
    /// exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if a namespace cannot be joined or the shell cannot
    /// be started.
    pub fn run(&self) -> Result<i32> {
        join_namespaces(self.pid, &EXEC_NAMESPACES)?;
        std::env::set_current_dir("/").map_err(|e| CapsuleError::io("/", e))?;
        tracing::debug!(pid = self.pid, command = %self.command, "running command in container");
        let status = Command::new(EXEC_SHELL)
            .arg("-c")
            .arg(&self.command)
            .status()
            .map_err(|e| CapsuleError::io(EXEC_SHELL, e))?;
        Ok(exit_code(status))
    }
}

/// Re-executes the binary so that it enters container `pid` and runs
/// `command` there. Standard streams are inherited.
///
/// # Errors
///
/// Returns [`CapsuleError::Config`] for an empty command, or an I/O error
/// if the re-execution cannot be started.
pub fn exec_in_container(pid: i32, command: &[String]) -> Result<i32> {
    if command.is_empty() {
        return Err(CapsuleError::Config {
            message: "exec command is empty".into(),
        });
    }
    let line = command.join(" ");
    tracing::info!(pid, command = %line, "exec into container");

    let status = Command::new(SELF_EXE)
        .arg(EXEC_VERB)
        .envs(container_environ(pid))
        .env(ENV_EXEC_PID, pid.to_string())
        .env(ENV_EXEC_CMD, &line)
        .status()
        .map_err(|e| CapsuleError::io(SELF_EXE, e))?;
    Ok(exit_code(status))
}

/// Environment of process `pid`; empty (with a warning) if unreadable.
#[must_use]
pub fn container_environ(pid: i32) -> Vec<(String, String)> {
    let path = format!("/proc/{pid}/environ");
    match std::fs::read(&path) {
        Ok(raw) => parse_environ(&raw),
        Err(e) => {
            tracing::warn!(pid, error = %e, "container environment unreadable");
            Vec::new()
        }
    }
}

/// Splits a NUL-separated `KEY=VALUE` block.
#[must_use]
pub fn parse_environ(raw: &[u8]) -> Vec<(String, String)> {
    raw.split(|b| *b == 0)
        .filter_map(|entry| {
            let entry = std::str::from_utf8(entry).ok()?;
            let (key, value) = entry.split_once('=')?;
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}
