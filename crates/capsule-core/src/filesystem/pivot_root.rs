//! Root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`.

use std::path::Path;

use capsule_common::error::{CapsuleError, Result};

/// Directory, relative to the new root, that briefly holds the old root.
pub const PUT_OLD: &str = ".pivot_root";

/// Makes `new_root` the root filesystem of the calling mount namespace.
///
/// The old root is stacked under [`PUT_OLD`]. While it is still attached,
/// fresh `/proc` and `/dev` are mounted in the new root; then the old root
/// is lazily unmounted and the directory removed, leaving nothing of the
/// host visible.
///
/// # Errors
///
/// Returns [`CapsuleError::PermissionDenied`] if any mount step or the
/// pivot itself is refused, or an I/O error for the scratch directory.
#[cfg(target_os = "linux")]
pub fn pivot_root(new_root: &Path) -> Result<()> {
    use nix::mount::{MntFlags, MsFlags, mount, umount2};

    let denied = |step: &str, e: nix::Error| CapsuleError::PermissionDenied {
        message: format!("{step} failed: {e}"),
    };

    // Keep the pivot from propagating into the host's mount namespace.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| denied("making / private", e))?;

    // pivot_root needs new_root to be a mount point of its own.
    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| denied("bind mounting new root", e))?;

    let put_old = new_root.join(PUT_OLD);
    std::fs::create_dir_all(&put_old).map_err(|e| CapsuleError::io(&put_old, e))?;

    nix::unistd::pivot_root(new_root, &put_old).map_err(|e| denied("pivot_root", e))?;
    nix::unistd::chdir("/").map_err(|e| denied("chdir to new root", e))?;

    super::mount::mount_container_filesystems(Path::new("/"))?;

    let put_old = Path::new("/").join(PUT_OLD);
    umount2(&put_old, MntFlags::MNT_DETACH).map_err(|e| denied("unmounting old root", e))?;
    std::fs::remove_dir(&put_old).map_err(|e| CapsuleError::io(&put_old, e))?;

    tracing::info!(new_root = %new_root.display(), "pivot_root complete");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: `pivot_root` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn pivot_root(_new_root: &Path) -> Result<()> {
    Err(CapsuleError::Config {
        message: "Linux required for native container operations".into(),
    })
}
