//! Cpuset adapter.

use std::path::Path;

use capsule_common::error::Result;
use capsule_common::types::ResourceConfig;

use super::resolver::{CgroupResolver, CgroupVersion};
use super::{Subsystem, write_control};

/// Adapter for the `cpuset` controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpusetSubsystem;

impl Subsystem for CpusetSubsystem {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    fn set(&self, resolver: &CgroupResolver, group: &str, res: &ResourceConfig) -> Result<()> {
        let (hierarchy, dir) = resolver.cgroup_path(self.name(), group, true)?;
        // A v1 cpuset refuses tasks (ENOSPC) until both cpus and memory
        // nodes are populated, whether or not a cpu set was requested.
        if hierarchy.version == CgroupVersion::V1 {
            inherit_from_parent(&dir, "cpuset.cpus")?;
            inherit_from_parent(&dir, "cpuset.mems")?;
        }
        if res.cpu_set.is_empty() {
            return Ok(());
        }
        write_control(&dir, "cpuset.cpus", &res.cpu_set)
    }
}

/// Copies `file` from the parent group when it is empty in `dir`.
fn inherit_from_parent(dir: &Path, file: &str) -> Result<()> {
    let current = std::fs::read_to_string(dir.join(file)).unwrap_or_default();
    if !current.trim().is_empty() {
        return Ok(());
    }
    let Some(parent) = dir.parent() else {
        return Ok(());
    };
    let inherited = std::fs::read_to_string(parent.join(file)).unwrap_or_default();
    let inherited = inherited.trim();
    if inherited.is_empty() {
        return Ok(());
    }
    write_control(dir, file, inherited)
}
