//! User namespace id mapping.
//!
//! The container's root user maps onto the launching user with a mapping
//! of size one, so uid 0 inside is never host root unless the launcher
//! already was.

use std::path::Path;

use capsule_common::error::{CapsuleError, Result};

/// Writes the uid/gid maps for a freshly cloned process.
///
/// # Errors
///
/// Returns an error if any of the `/proc/<pid>` map files cannot be written.
pub fn write_id_maps(pid: i32, host_uid: u32, host_gid: u32) -> Result<()> {
    write_id_maps_at(&Path::new("/proc").join(pid.to_string()), host_uid, host_gid)?;
    tracing::debug!(pid, host_uid, host_gid, "wrote UID/GID map");
    Ok(())
}

/// Writes the maps into an arbitrary `/proc/<pid>`-shaped directory.
///
/// `setgroups` is denied first (when the kernel exposes it) because an
/// unprivileged writer may not install a gid map otherwise.
///
/// # Errors
///
/// Returns an error if a map file cannot be written.
pub fn write_id_maps_at(proc_dir: &Path, host_uid: u32, host_gid: u32) -> Result<()> {
    let setgroups = proc_dir.join("setgroups");
    if setgroups.exists() {
        std::fs::write(&setgroups, "deny").map_err(|e| CapsuleError::io(&setgroups, e))?;
    }
    let uid_map = proc_dir.join("uid_map");
    std::fs::write(&uid_map, id_map_line(host_uid)).map_err(|e| CapsuleError::io(&uid_map, e))?;
    let gid_map = proc_dir.join("gid_map");
    std::fs::write(&gid_map, id_map_line(host_gid)).map_err(|e| CapsuleError::io(&gid_map, e))?;
    Ok(())
}

fn id_map_line(host_id: u32) -> String {
    format!("0 {host_id} 1")
}
