//! Mount utilities for container filesystem setup.
//!
//! Handles the private `/proc` and `/dev` mounts done by init and the
//! volume bind mounts done while preparing a workspace.

use std::path::Path;

use capsule_common::error::{CapsuleError, Result};

/// Mount data for the container's `/dev` tmpfs.
pub const DEV_MOUNT_DATA: &str = "mode=755";

/// Mounts a fresh `proc` and a `/dev` tmpfs under `root`.
///
/// Inside a user namespace the kernel only allows a new procfs while a
/// fully visible one is still reachable, so this runs from
/// [`super::pivot_root::pivot_root`] before the old root is detached.
///
/// # Errors
///
/// Returns an error if a mount point cannot be created or a mount fails.
#[cfg(target_os = "linux")]
pub fn mount_container_filesystems(root: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let proc_dir = root.join("proc");
    ensure_dir(&proc_dir)?;
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| CapsuleError::PermissionDenied {
        message: format!("mounting /proc failed: {e}"),
    })?;

    let dev_dir = root.join("dev");
    ensure_dir(&dev_dir)?;
    mount(
        Some("tmpfs"),
        &dev_dir,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some(DEV_MOUNT_DATA),
    )
    .map_err(|e| CapsuleError::PermissionDenied {
        message: format!("mounting /dev failed: {e}"),
    })?;

    tracing::debug!(root = %root.display(), "mounted /proc and /dev");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: container mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_container_filesystems(_root: &Path) -> Result<()> {
    Err(CapsuleError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Creates a recursive bind mount from `source` to `target`.
///
/// Both directories are created if missing.
///
/// # Errors
///
/// Returns an error if a directory cannot be created or `mount(2)` fails.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    ensure_dir(source)?;
    ensure_dir(target)?;
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| CapsuleError::PermissionDenied {
        message: format!("bind mount {} -> {} failed: {e}", source.display(), target.display()),
    })?;
    tracing::debug!(source = %source.display(), target = %target.display(), "bind mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: bind mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path) -> Result<()> {
    Err(CapsuleError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Lazily detaches whatever is mounted at `target`.
///
/// # Errors
///
/// Returns [`CapsuleError::PermissionDenied`] if `umount2(2)` fails.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> Result<()> {
    nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH).map_err(|e| {
        CapsuleError::PermissionDenied {
            message: format!("unmount {} failed: {e}", target.display()),
        }
    })?;
    tracing::debug!(path = %target.display(), "unmounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: unmounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> Result<()> {
    Err(CapsuleError::Config {
        message: "Linux required for native container operations".into(),
    })
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| CapsuleError::io(path, e))
}
