//! Linux namespace management for container isolation.
//!
//! The launcher requests every namespace at `clone(2)` time through
//! [`NamespaceConfig::clone_flags`]; `exec` later joins a running
//! container's namespaces with [`join_namespaces`].

pub mod network;
pub mod user;

use std::path::PathBuf;

use capsule_common::error::{CapsuleError, Result};

/// Kernel namespace kinds the runtime works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Hostname and NIS domain name.
    Uts,
    /// Network stack.
    Net,
    /// Process ids.
    Pid,
    /// Mount table.
    Mnt,
    /// User and group ids.
    User,
}

/// Namespaces joined by `exec`, in join order.
///
/// The mount namespace goes last since entering it changes how the
/// remaining `/proc/<pid>/ns/*` paths would resolve.
pub const EXEC_NAMESPACES: [NamespaceKind; 5] = [
    NamespaceKind::Ipc,
    NamespaceKind::Uts,
    NamespaceKind::Net,
    NamespaceKind::Pid,
    NamespaceKind::Mnt,
];

impl NamespaceKind {
    /// Entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Net => "net",
            Self::Pid => "pid",
            Self::Mnt => "mnt",
            Self::User => "user",
        }
    }

    /// Path of `pid`'s handle for this namespace.
    #[must_use]
    pub fn proc_path(self, pid: i32) -> PathBuf {
        PathBuf::from(format!("/proc/{pid}/ns/{}", self.proc_name()))
    }

    /// Matching `clone(2)` / `setns(2)` flag.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub const fn clone_flag(self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;
        match self {
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Net => CloneFlags::CLONE_NEWNET,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Mnt => CloneFlags::CLONE_NEWNS,
            Self::User => CloneFlags::CLONE_NEWUSER,
        }
    }
}

/// Configuration for which namespaces a new container gets.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate network namespace.
    pub network: bool,
    /// Isolate user namespace.
    pub user: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            network: true,
            user: true,
            ipc: true,
            uts: true,
        }
    }
}

impl NamespaceConfig {
    /// Enabled namespace kinds.
    #[must_use]
    pub fn kinds(&self) -> Vec<NamespaceKind> {
        [
            (self.uts, NamespaceKind::Uts),
            (self.pid, NamespaceKind::Pid),
            (self.mount, NamespaceKind::Mnt),
            (self.network, NamespaceKind::Net),
            (self.ipc, NamespaceKind::Ipc),
            (self.user, NamespaceKind::User),
        ]
        .into_iter()
        .filter_map(|(enabled, kind)| enabled.then_some(kind))
        .collect()
    }

    /// Flags to pass to `clone(2)`.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn clone_flags(&self) -> nix::sched::CloneFlags {
        self.kinds()
            .into_iter()
            .fold(nix::sched::CloneFlags::empty(), |acc, k| acc | k.clone_flag())
    }
}

/// Joins the given namespaces of a running process.
///
/// Every handle is opened before the first `setns` so the later lookups
/// are not affected by an earlier switch.
///
/// # Errors
///
/// Returns [`CapsuleError::NotFound`] if the process is gone, or
/// [`CapsuleError::PermissionDenied`] if a `setns` call is refused.
#[cfg(target_os = "linux")]
pub fn join_namespaces(pid: i32, kinds: &[NamespaceKind]) -> Result<()> {
    let handles = kinds
        .iter()
        .map(|kind| {
            let path = kind.proc_path(pid);
            std::fs::File::open(&path)
                .map(|file| (*kind, file))
                .map_err(|e| CapsuleError::io(path, e))
        })
        .collect::<Result<Vec<_>>>()?;

    for (kind, file) in handles {
        nix::sched::setns(&file, kind.clone_flag()).map_err(|e| {
            CapsuleError::PermissionDenied {
                message: format!("setns {} of pid {pid} failed: {e}", kind.proc_name()),
            }
        })?;
        tracing::debug!(pid, ns = kind.proc_name(), "namespace joined");
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn join_namespaces(_pid: i32, _kinds: &[NamespaceKind]) -> Result<()> {
    Err(CapsuleError::Config {
        message: "Linux required for native container operations".into(),
    })
}
