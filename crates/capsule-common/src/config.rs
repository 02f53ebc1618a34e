//! Runtime configuration model.
//!
//! Every on-disk location used by the runtime lives here so that components
//! can be handed an explicit configuration instead of reaching for globals.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for the capsule runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding `<name>/config.json` and `<name>/container.log`.
    pub container_dir: PathBuf,
    /// Directory holding one JSON file per network.
    pub network_dir: PathBuf,
    /// IPAM allocation file.
    pub ipam_file: PathBuf,
    /// Root for images, write layers and merged mount points.
    pub workspace_root: PathBuf,
    /// Mount table used to locate cgroup hierarchies.
    pub mountinfo: PathBuf,
    /// Prefix for per-container cgroup names.
    pub cgroup_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            container_dir: PathBuf::from(constants::DEFAULT_CONTAINER_DIR),
            network_dir: PathBuf::from(constants::DEFAULT_NETWORK_DIR),
            ipam_file: PathBuf::from(constants::DEFAULT_IPAM_FILE),
            workspace_root: PathBuf::from(constants::DEFAULT_WORKSPACE_ROOT),
            mountinfo: PathBuf::from(constants::DEFAULT_MOUNTINFO),
            cgroup_prefix: constants::CGROUP_PREFIX.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Relocates all state under a single root directory.
    ///
    /// The mount table and cgroup prefix are left at their defaults since
    /// they describe the host, not the runtime's own state.
    #[must_use]
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            container_dir: root.join("containers"),
            network_dir: root.join("network").join("network"),
            ipam_file: root.join("network").join("ipam").join("subnet.json"),
            workspace_root: root.join("workspace"),
            ..Self::default()
        }
    }

    /// Overrides the mount table consulted for cgroup hierarchies.
    #[must_use]
    pub fn with_mountinfo(mut self, mountinfo: impl Into<PathBuf>) -> Self {
        self.mountinfo = mountinfo.into();
        self
    }

    /// Returns the cgroup name used for a container.
    #[must_use]
    pub fn cgroup_name(&self, container_id: &str) -> String {
        format!("{}-{container_id}", self.cgroup_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_live_under_var_run() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.container_dir, Path::new("/var/run/capsule/containers"));
        assert_eq!(
            cfg.ipam_file,
            Path::new("/var/run/capsule/network/ipam/subnet.json")
        );
    }

    #[test]
    fn with_root_relocates_state() {
        let cfg = RuntimeConfig::with_root("/tmp/x");
        assert_eq!(cfg.container_dir, Path::new("/tmp/x/containers"));
        assert_eq!(cfg.network_dir, Path::new("/tmp/x/network/network"));
        assert_eq!(cfg.ipam_file, Path::new("/tmp/x/network/ipam/subnet.json"));
        assert_eq!(cfg.mountinfo, Path::new("/proc/self/mountinfo"));
    }

    #[test]
    fn cgroup_name_uses_prefix() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.cgroup_name("0123456789"), "capsule-0123456789");
    }
}
