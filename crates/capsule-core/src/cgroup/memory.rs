//! Memory controller adapter.
//!
//! Writes `memory.limit_in_bytes` on v1 hierarchies and `memory.max` on the
//! unified hierarchy. The value is passed through untouched so the kernel's
//! own suffix parsing (`100m`, `1g`) applies.

use capsule_common::error::Result;
use capsule_common::types::ResourceConfig;

use super::resolver::{CgroupResolver, CgroupVersion};
use super::{Subsystem, write_control};

/// Adapter for the `memory` controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySubsystem;

impl Subsystem for MemorySubsystem {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set(&self, resolver: &CgroupResolver, group: &str, res: &ResourceConfig) -> Result<()> {
        let (hierarchy, dir) = resolver.cgroup_path(self.name(), group, true)?;
        if res.memory_limit.is_empty() {
            return Ok(());
        }
        let file = match hierarchy.version {
            CgroupVersion::V1 => "memory.limit_in_bytes",
            CgroupVersion::V2 => "memory.max",
        };
        write_control(&dir, file, &res.memory_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::tests::FakeHost;

    #[test]
    fn empty_limit_creates_group_without_writing() {
        let host = FakeHost::with_controllers(&["memory"]);
        MemorySubsystem
            .set(&host.resolver, "g", &ResourceConfig::default())
            .expect("set");
        let dir = host.group_dir("memory", "g");
        assert!(dir.is_dir());
        assert!(!dir.join("memory.limit_in_bytes").exists());
    }

    #[test]
    fn unmounted_controller_is_not_found() {
        let host = FakeHost::with_controllers(&["cpu"]);
        let res = ResourceConfig {
            memory_limit: "64m".into(),
            ..ResourceConfig::default()
        };
        let err = MemorySubsystem.set(&host.resolver, "g", &res).expect_err("absent");
        assert!(err.is_not_found());
    }
}
