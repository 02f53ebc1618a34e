//! Domain primitive types used across the capsule workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::CONTAINER_ID_LENGTH;

/// Unique identifier for a container instance.
///
/// Generated IDs are fixed-length decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random numeric container ID.
    #[must_use]
    pub fn generate() -> Self {
        let modulus = 10_u128.pow(CONTAINER_ID_LENGTH as u32);
        let value = uuid::Uuid::new_v4().as_u128() % modulus;
        Self(format!("{value:0width$}", width = CONTAINER_ID_LENGTH))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the ID has the generated shape.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == CONTAINER_ID_LENGTH && self.0.bytes().all(|b| b.is_ascii_digit())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource limits handed to the cgroup manager.
///
/// Values are passed to the kernel verbatim; an empty string means
/// "leave this controller's limit alone".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit in a kernel-accepted byte quantity (e.g. `100m`).
    pub memory_limit: String,
    /// Relative CPU weight in cgroup v1 `cpu.shares` units.
    pub cpu_share: String,
    /// CPU list for the cpuset controller (e.g. `0-1`).
    pub cpu_set: String,
}

impl ResourceConfig {
    /// Returns `true` when no limit is requested at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory_limit.is_empty() && self.cpu_share.is_empty() && self.cpu_set.is_empty()
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Container is actively running.
    Running,
    /// Container has been stopped through the runtime.
    Stopped,
    /// Container process went away on its own.
    Exited,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Persistent record of one container, stored as `<name>/config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Generated container ID.
    pub id: ContainerId,
    /// Host pid of the container's init process; blank once stopped.
    pub pid: String,
    /// User-supplied name, or the ID when none was given.
    pub name: String,
    /// Command line run inside the container.
    pub command: String,
    /// Local creation timestamp (`%Y-%m-%d %H:%M:%S`).
    pub created_time: String,
    /// Current lifecycle state.
    pub status: ContainerState,
    /// Volume spec (`host:container`) or empty.
    pub volume: String,
    /// Published ports as `hostPort:containerPort`.
    pub port_mapping: Vec<String>,
    /// Network the container was attached to, if any.
    #[serde(default)]
    pub network: Option<String>,
    /// Address allocated on that network, if any.
    #[serde(default)]
    pub ip: Option<String>,
}

impl ContainerInfo {
    /// Parses the recorded pid, if the container still has one.
    #[must_use]
    pub fn host_pid(&self) -> Option<i32> {
        self.pid.trim().parse().ok()
    }
}
