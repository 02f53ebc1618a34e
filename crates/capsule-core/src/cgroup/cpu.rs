//! CPU share adapter.
//!
//! Shares use cgroup v1 units (`cpu.shares`, default 1024). On the unified
//! hierarchy they are converted to `cpu.weight` with the same linear mapping
//! the kernel documentation and common runtimes use.

use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::ResourceConfig;

use super::resolver::{CgroupResolver, CgroupVersion};
use super::{Subsystem, write_control};

const MIN_SHARES: u64 = 2;
const MAX_SHARES: u64 = 262_144;

/// Adapter for the `cpu` controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuSubsystem;

impl Subsystem for CpuSubsystem {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn set(&self, resolver: &CgroupResolver, group: &str, res: &ResourceConfig) -> Result<()> {
        let (hierarchy, dir) = resolver.cgroup_path(self.name(), group, true)?;
        if res.cpu_share.is_empty() {
            return Ok(());
        }
        match hierarchy.version {
            CgroupVersion::V1 => write_control(&dir, "cpu.shares", &res.cpu_share),
            CgroupVersion::V2 => {
                let weight = shares_to_weight(&res.cpu_share)?;
                write_control(&dir, "cpu.weight", &weight.to_string())
            }
        }
    }
}

/// Converts v1 shares (2..=262144) to a v2 weight (1..=10000).
///
/// # Errors
///
/// Returns [`CapsuleError::Config`] if `shares` is not a number.
pub fn shares_to_weight(shares: &str) -> Result<u64> {
    let shares: u64 = shares.trim().parse().map_err(|_| CapsuleError::Config {
        message: format!("invalid cpu share value: {shares:?}"),
    })?;
    let shares = shares.clamp(MIN_SHARES, MAX_SHARES);
    Ok(1 + ((shares - MIN_SHARES) * 9999) / (MAX_SHARES - MIN_SHARES))
}
