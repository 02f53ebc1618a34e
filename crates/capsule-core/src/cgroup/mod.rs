//! Cgroup resource management.
//!
//! A [`CgroupManager`] owns one logical group name and fans every request
//! out to a fixed, ordered list of [`Subsystem`] adapters (cpuset, memory,
//! cpu). A host rarely mounts every controller, so one adapter failing never
//! stops the others; each call returns a [`CgroupReport`] collecting what
//! went wrong instead.

pub mod cpu;
pub mod cpuset;
pub mod memory;
pub mod resolver;

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::ResourceConfig;

pub use resolver::{CgroupResolver, CgroupVersion, Hierarchy};

/// One resource controller adapter.
///
/// Adapters hold no state; everything lives in the cgroup filesystem.
/// `set` and `apply` must resolve the same group directory for a given
/// group name.
pub trait Subsystem: fmt::Debug + Send + Sync {
    /// Controller name as it appears in the mount table.
    fn name(&self) -> &'static str;

    /// Creates the group if needed and writes the limits this controller
    /// cares about.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller is not mounted or a limit file
    /// rejects the value.
    fn set(&self, resolver: &CgroupResolver, group: &str, res: &ResourceConfig) -> Result<()>;

    /// Moves `pid` into an existing group.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if the group was never created.
    fn apply(&self, resolver: &CgroupResolver, group: &str, pid: i32) -> Result<()> {
        let (hierarchy, path) = resolver.cgroup_path(self.name(), group, false)?;
        join_group(&hierarchy, &path, pid)
    }

    /// Deletes the group directory.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if there is nothing to delete.
    fn remove(&self, resolver: &CgroupResolver, group: &str) -> Result<()> {
        let (_, path) = resolver.cgroup_path(self.name(), group, false)?;
        remove_group(&path)
    }
}

/// Controllers managed for every container, in evaluation order.
#[must_use]
pub fn default_subsystems() -> Vec<Box<dyn Subsystem>> {
    vec![
        Box::new(cpuset::CpusetSubsystem),
        Box::new(memory::MemorySubsystem),
        Box::new(cpu::CpuSubsystem),
    ]
}

/// Fan-out request kind, used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupOperation {
    /// Writing resource limits.
    Set,
    /// Joining a process.
    Apply,
    /// Removing the group.
    Destroy,
}

impl fmt::Display for CgroupOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => write!(f, "set"),
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// A single adapter's failure.
#[derive(Debug)]
pub struct CgroupFailure {
    /// Controller that failed.
    pub subsystem: &'static str,
    /// What went wrong.
    pub error: CapsuleError,
}

impl CgroupFailure {
    /// `true` when the controller or group is simply absent on this host.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        self.error.is_not_found()
    }
}

/// Outcome of one manager fan-out.
#[derive(Debug)]
pub struct CgroupReport {
    /// Which request produced this report.
    pub operation: CgroupOperation,
    /// Controllers that handled the request.
    pub succeeded: Vec<&'static str>,
    /// Controllers that did not.
    pub failures: Vec<CgroupFailure>,
}

impl CgroupReport {
    fn new(operation: CgroupOperation) -> Self {
        Self {
            operation,
            succeeded: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// `true` when every controller succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures other than absent controllers or groups.
    pub fn hard_failures(&self) -> impl Iterator<Item = &CgroupFailure> {
        self.failures.iter().filter(|f| !f.is_unavailable())
    }

    /// Emits one warning per failure.
    pub fn log(&self) {
        for failure in &self.failures {
            if failure.is_unavailable() {
                tracing::warn!(
                    operation = %self.operation,
                    subsystem = failure.subsystem,
                    error = %failure.error,
                    "cgroup controller unavailable"
                );
            } else {
                tracing::warn!(
                    operation = %self.operation,
                    subsystem = failure.subsystem,
                    error = %failure.error,
                    "cgroup controller failed"
                );
            }
        }
    }

    /// Turns hard failures into an error, tolerating absent controllers.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Cgroup`] listing every hard failure.
    pub fn into_result(self) -> Result<()> {
        let message = self
            .hard_failures()
            .map(|f| format!("{}: {}", f.subsystem, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        if message.is_empty() {
            Ok(())
        } else {
            Err(CapsuleError::Cgroup {
                message: format!("{} failed: {message}", self.operation),
            })
        }
    }
}

/// Handle to one container's cgroup across every managed controller.
#[derive(Debug)]
pub struct CgroupManager {
    group: String,
    resolver: CgroupResolver,
    subsystems: Vec<Box<dyn Subsystem>>,
}

impl CgroupManager {
    /// Creates a manager for `group` over the default controllers.
    #[must_use]
    pub fn new(group: impl Into<String>, resolver: CgroupResolver) -> Self {
        Self::with_subsystems(group, resolver, default_subsystems())
    }

    /// Creates a manager over an explicit controller list.
    #[must_use]
    pub fn with_subsystems(
        group: impl Into<String>,
        resolver: CgroupResolver,
        subsystems: Vec<Box<dyn Subsystem>>,
    ) -> Self {
        Self {
            group: group.into(),
            resolver,
            subsystems,
        }
    }

    /// Logical group name.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Writes `res` through every controller.
    pub fn set(&self, res: &ResourceConfig) -> CgroupReport {
        self.fan_out(CgroupOperation::Set, |s| s.set(&self.resolver, &self.group, res))
    }

    /// Moves `pid` into the group on every controller.
    pub fn apply(&self, pid: i32) -> CgroupReport {
        self.fan_out(CgroupOperation::Apply, |s| s.apply(&self.resolver, &self.group, pid))
    }

    /// Removes the group from every controller.
    ///
    /// Absent controllers and groups are not failures here, so destroying
    /// a group that was never set up yields a clean report.
    pub fn destroy(&self) -> CgroupReport {
        let mut report =
            self.fan_out(CgroupOperation::Destroy, |s| s.remove(&self.resolver, &self.group));
        report.failures.retain(|f| !f.is_unavailable());
        tracing::debug!(group = %self.group, "cgroup destroyed");
        report
    }

    fn fan_out<F>(&self, operation: CgroupOperation, mut call: F) -> CgroupReport
    where
        F: FnMut(&dyn Subsystem) -> Result<()>,
    {
        let mut report = CgroupReport::new(operation);
        for subsystem in &self.subsystems {
            match call(subsystem.as_ref()) {
                Ok(()) => report.succeeded.push(subsystem.name()),
                Err(error) => report.failures.push(CgroupFailure {
                    subsystem: subsystem.name(),
                    error,
                }),
            }
        }
        report
    }
}

/// Writes a single value into a control file.
pub(crate) fn write_control(dir: &Path, file: &str, value: &str) -> Result<()> {
    let path = dir.join(file);
    std::fs::write(&path, value).map_err(|e| CapsuleError::io(&path, e))?;
    tracing::debug!(path = %path.display(), value, "cgroup limit written");
    Ok(())
}

/// Appends `pid` to the group's membership file.
pub(crate) fn join_group(hierarchy: &Hierarchy, dir: &Path, pid: i32) -> Result<()> {
    let name = match hierarchy.version {
        CgroupVersion::V1 => "tasks",
        CgroupVersion::V2 => "cgroup.procs",
    };
    let path = dir.join(name);
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .map_err(|e| CapsuleError::io(&path, e))?;
    file.write_all(pid.to_string().as_bytes())
        .map_err(|e| CapsuleError::io(&path, e))?;
    Ok(())
}

/// Deletes a group directory.
///
/// A real cgroup directory is removed with a plain `rmdir` even though it
/// lists control files; a regular directory falls back to recursive
/// removal.
pub(crate) fn remove_group(dir: &Path) -> Result<()> {
    match std::fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
            std::fs::remove_dir_all(dir).map_err(|e| CapsuleError::io(dir, e))
        }
        Err(e) => Err(CapsuleError::io(dir, e)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use super::*;

    /// Fake v1 host with one directory per mounted controller.
    pub(crate) struct FakeHost {
        pub dir: tempfile::TempDir,
        pub resolver: CgroupResolver,
    }

    impl FakeHost {
        pub fn with_controllers(controllers: &[&str]) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut table = String::from("22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw\n");
            for (i, ctrl) in controllers.iter().enumerate() {
                let mount = dir.path().join(ctrl);
                std::fs::create_dir_all(&mount).expect("mkdir");
                table.push_str(&format!(
                    "{} 25 0:{} / {} rw,nosuid - cgroup cgroup rw,{ctrl}\n",
                    30 + i,
                    28 + i,
                    mount.display()
                ));
            }
            let mountinfo = dir.path().join("mountinfo");
            std::fs::write(&mountinfo, table).expect("write");
            let resolver = CgroupResolver::new(mountinfo);
            Self { dir, resolver }
        }

        pub fn group_dir(&self, controller: &str, group: &str) -> PathBuf {
            self.dir.path().join(controller).join(group)
        }
    }

    fn limits() -> ResourceConfig {
        ResourceConfig {
            memory_limit: "100m".into(),
            cpu_share: "512".into(),
            cpu_set: "0-1".into(),
        }
    }

    #[test]
    fn default_order_is_cpuset_memory_cpu() {
        let names: Vec<_> = default_subsystems().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["cpuset", "memory", "cpu"]);
    }

    #[test]
    fn set_and_apply_reach_the_same_group() {
        let host = FakeHost::with_controllers(&["cpuset", "memory", "cpu"]);
        std::fs::write(host.dir.path().join("cpuset/cpuset.mems"), "0\n").expect("write");
        let manager = CgroupManager::new("capsule-1", host.resolver.clone());

        let report = manager.set(&limits());
        assert!(report.is_clean(), "{report:?}");
        let report = manager.apply(4242);
        assert!(report.is_clean(), "{report:?}");

        let mem = host.group_dir("memory", "capsule-1");
        assert_eq!(
            std::fs::read_to_string(mem.join("memory.limit_in_bytes")).expect("read"),
            "100m"
        );
        assert_eq!(std::fs::read_to_string(mem.join("tasks")).expect("read"), "4242");
        let cpu = host.group_dir("cpu", "capsule-1");
        assert_eq!(std::fs::read_to_string(cpu.join("cpu.shares")).expect("read"), "512");
        assert_eq!(std::fs::read_to_string(cpu.join("tasks")).expect("read"), "4242");
    }

    #[test]
    fn missing_controller_does_not_block_others() {
        let host = FakeHost::with_controllers(&["memory"]);
        let manager = CgroupManager::new("capsule-2", host.resolver.clone());

        let report = manager.set(&limits());
        assert_eq!(report.succeeded, vec!["memory"]);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(CgroupFailure::is_unavailable));
        assert!(report.into_result().is_ok());

        let report = manager.apply(7);
        assert_eq!(report.succeeded, vec!["memory"]);
    }

    #[test]
    fn apply_without_set_is_unavailable() {
        let host = FakeHost::with_controllers(&["memory"]);
        let manager = CgroupManager::with_subsystems(
            "capsule-3",
            host.resolver.clone(),
            vec![Box::new(memory::MemorySubsystem)],
        );
        let report = manager.apply(7);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].is_unavailable());
    }

    #[test]
    fn destroy_without_setup_is_clean() {
        let host = FakeHost::with_controllers(&["memory", "cpu"]);
        let manager = CgroupManager::new("never-created", host.resolver.clone());
        let report = manager.destroy();
        assert!(report.is_clean(), "{report:?}");
    }

    #[test]
    fn destroy_removes_every_group() {
        let host = FakeHost::with_controllers(&["memory", "cpu"]);
        let manager = CgroupManager::new("capsule-4", host.resolver.clone());
        let _ = manager.set(&limits());
        let _ = manager.apply(99);
        assert!(host.group_dir("memory", "capsule-4").exists());

        assert!(manager.destroy().is_clean());
        assert!(!host.group_dir("memory", "capsule-4").exists());
        assert!(!host.group_dir("cpu", "capsule-4").exists());
        // Second destroy is a no-op.
        assert!(manager.destroy().is_clean());
    }

    #[test]
    fn invalid_value_is_a_hard_failure() {
        let host = FakeHost::with_controllers(&["memory"]);
        // A directory where the limit file should be makes the write fail.
        std::fs::create_dir_all(host.group_dir("memory", "bad").join("memory.limit_in_bytes"))
            .expect("mkdir");
        let manager = CgroupManager::with_subsystems(
            "bad",
            host.resolver.clone(),
            vec![Box::new(memory::MemorySubsystem)],
        );
        let report = manager.set(&limits());
        assert_eq!(report.hard_failures().count(), 1);
        let err = report.into_result().expect_err("hard failure");
        assert!(matches!(err, CapsuleError::Cgroup { .. }));
        assert!(err.to_string().contains("memory"));
    }
}
