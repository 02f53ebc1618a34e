//! Unified error types for the capsule workspace.
//!
//! Every crate returns [`CapsuleError`]; the CLI converts it into an
//! `anyhow::Error` at the process boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value or user input is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource with the same identity already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the conflicting resource.
        kind: &'static str,
        /// Identifier of the conflicting resource.
        id: String,
    },

    /// The operation is not allowed in the resource's current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the refused transition.
        message: String,
    },

    /// A permission or privileged-operation error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// One or more cgroup controllers rejected a request.
    #[error("cgroup error: {message}")]
    Cgroup {
        /// Per-controller failure summary.
        message: String,
    },

    /// A netlink request was rejected by the kernel.
    #[error("netlink error: {message}")]
    Netlink {
        /// Description of the failed request.
        message: String,
    },

    /// A firewall command failed.
    #[error("firewall error: {message}")]
    Firewall {
        /// Description of the failed rule change.
        message: String,
    },

    /// No free address is left in a subnet.
    #[error("no free address left in subnet {subnet}")]
    AddressExhausted {
        /// Subnet that ran out of addresses.
        subnet: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CapsuleError {
    /// Builds an [`CapsuleError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` when the error means "the thing is not there".
    ///
    /// Covers both [`CapsuleError::NotFound`] and I/O errors of kind
    /// [`std::io::ErrorKind::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CapsuleError>;
