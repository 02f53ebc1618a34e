//! Locating controller hierarchies and per-container cgroup directories.
//!
//! Hierarchies are discovered from the process mount table. A cgroup v1
//! controller is found through the super options of its `cgroup` mount;
//! on a unified (v2) host the controller must be listed in the root's
//! `cgroup.controllers`.

use std::fs::DirBuilder;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use capsule_common::constants::DEFAULT_MOUNTINFO;
use capsule_common::error::{CapsuleError, Result};

/// Cgroup filesystem flavour a hierarchy is mounted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    /// One hierarchy per controller (`cgroup` filesystem).
    V1,
    /// Unified hierarchy (`cgroup2` filesystem).
    V2,
}

/// A mounted hierarchy that serves a given controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    /// Where the hierarchy is mounted.
    pub mount_point: PathBuf,
    /// Filesystem flavour.
    pub version: CgroupVersion,
}

/// One parsed `/proc/<pid>/mountinfo` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mount point relative to the process root.
    pub mount_point: PathBuf,
    /// Filesystem type after the ` - ` separator.
    pub fs_type: String,
    /// Comma-separated super block options, split.
    pub super_options: Vec<String>,
}

/// Parses a single mountinfo line.
///
/// Returns `None` for lines that do not have the expected shape.
#[must_use]
pub fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let mount_point = fields.get(4)?;
    let sep = fields.iter().position(|f| *f == "-")?;
    let fs_type = fields.get(sep + 1)?;
    let super_options = fields
        .last()
        .map(|opts| opts.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    Some(MountEntry {
        mount_point: PathBuf::from(mount_point),
        fs_type: (*fs_type).to_string(),
        super_options,
    })
}

/// Resolves controller hierarchies and cgroup directories.
#[derive(Debug, Clone)]
pub struct CgroupResolver {
    mountinfo: PathBuf,
}

impl Default for CgroupResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MOUNTINFO)
    }
}

impl CgroupResolver {
    /// Creates a resolver that reads the given mount table.
    #[must_use]
    pub fn new(mountinfo: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: mountinfo.into(),
        }
    }

    /// Finds the hierarchy serving `controller`.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if no hierarchy serves the
    /// controller, or an I/O error if the mount table cannot be read.
    pub fn find_hierarchy(&self, controller: &str) -> Result<Hierarchy> {
        let file = std::fs::File::open(&self.mountinfo)
            .map_err(|e| CapsuleError::io(&self.mountinfo, e))?;
        let mut unified = None;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| CapsuleError::io(&self.mountinfo, e))?;
            let Some(entry) = parse_mountinfo_line(&line) else {
                continue;
            };
            match entry.fs_type.as_str() {
                "cgroup" if entry.super_options.iter().any(|o| o == controller) => {
                    return Ok(Hierarchy {
                        mount_point: entry.mount_point,
                        version: CgroupVersion::V1,
                    });
                }
                "cgroup2" if unified.is_none() => unified = Some(entry.mount_point),
                _ => {}
            }
        }

        if let Some(mount_point) = unified {
            if unified_has_controller(&mount_point, controller) {
                return Ok(Hierarchy {
                    mount_point,
                    version: CgroupVersion::V2,
                });
            }
        }

        Err(CapsuleError::NotFound {
            kind: "cgroup controller",
            id: controller.to_string(),
        })
    }

    /// Resolves the directory of `group` under `controller`'s hierarchy.
    ///
    /// With `auto_create` a missing directory is created (mode `0755`);
    /// a concurrent creation of the same directory is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if the controller is not mounted,
    /// or if the directory is missing and `auto_create` is false.
    pub fn cgroup_path(
        &self,
        controller: &str,
        group: &str,
        auto_create: bool,
    ) -> Result<(Hierarchy, PathBuf)> {
        let hierarchy = self.find_hierarchy(controller)?;
        let path = hierarchy.mount_point.join(group);
        match std::fs::metadata(&path) {
            Ok(_) => Ok((hierarchy, path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !auto_create {
                    return Err(CapsuleError::NotFound {
                        kind: "cgroup",
                        id: path.display().to_string(),
                    });
                }
                if hierarchy.version == CgroupVersion::V2 {
                    enable_in_ancestors(&hierarchy.mount_point, &path, controller);
                }
                DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(&path)
                    .map_err(|e| CapsuleError::io(&path, e))?;
                tracing::debug!(controller, path = %path.display(), "cgroup created");
                Ok((hierarchy, path))
            }
            Err(e) => Err(CapsuleError::io(&path, e)),
        }
    }
}

fn unified_has_controller(mount_point: &Path, controller: &str) -> bool {
    std::fs::read_to_string(mount_point.join("cgroup.controllers"))
        .map(|s| s.split_whitespace().any(|c| c == controller))
        .unwrap_or(false)
}

/// Delegates `controller` from the unified root down to `path`'s parent.
///
/// Best effort: a host that already delegates the controller (or refuses
/// to) is left as is and the subsequent writes report the real problem.
fn enable_in_ancestors(root: &Path, path: &Path, controller: &str) {
    let Ok(relative) = path.strip_prefix(root) else {
        return;
    };
    let mut dir = root.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        write_subtree_control(&dir, controller);
        dir.push(component);
    }
    write_subtree_control(&dir, controller);
}

fn write_subtree_control(dir: &Path, controller: &str) {
    let file = dir.join("cgroup.subtree_control");
    if let Err(e) = std::fs::write(&file, format!("+{controller}")) {
        tracing::debug!(path = %file.display(), error = %e, "subtree_control not updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1_MEMORY: &str = "33 25 0:28 / /sys/fs/cgroup/memory rw,nosuid,nodev,noexec,relatime shared:16 - cgroup cgroup rw,memory";
    const V1_CPU: &str = "34 25 0:29 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid shared:17 - cgroup cgroup rw,cpu,cpuacct";
    const ROOT: &str = "22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw";

    #[test]
    fn parses_v1_memory_line() {
        let entry = parse_mountinfo_line(V1_MEMORY).expect("parse");
        assert_eq!(entry.mount_point, Path::new("/sys/fs/cgroup/memory"));
        assert_eq!(entry.fs_type, "cgroup");
        assert!(entry.super_options.iter().any(|o| o == "memory"));
    }

    #[test]
    fn parses_line_with_several_optional_fields() {
        let line = "40 25 0:35 / /sys/fs/cgroup/cpuset rw shared:20 master:3 - cgroup cgroup rw,cpuset";
        let entry = parse_mountinfo_line(line).expect("parse");
        assert_eq!(entry.fs_type, "cgroup");
        assert_eq!(entry.super_options, vec!["rw", "cpuset"]);
    }

    #[test]
    fn rejects_truncated_line() {
        assert!(parse_mountinfo_line("1 2 3").is_none());
    }

    #[test]
    fn finds_v1_controller_among_comounted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mountinfo = dir.path().join("mountinfo");
        std::fs::write(&mountinfo, format!("{ROOT}\n{V1_MEMORY}\n{V1_CPU}\n")).expect("write");

        let resolver = CgroupResolver::new(&mountinfo);
        let cpu = resolver.find_hierarchy("cpu").expect("cpu");
        assert_eq!(cpu.mount_point, Path::new("/sys/fs/cgroup/cpu,cpuacct"));
        assert_eq!(cpu.version, CgroupVersion::V1);
    }

    #[test]
    fn missing_controller_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mountinfo = dir.path().join("mountinfo");
        std::fs::write(&mountinfo, format!("{ROOT}\n{V1_MEMORY}\n")).expect("write");

        let err = CgroupResolver::new(&mountinfo)
            .find_hierarchy("cpuset")
            .expect_err("cpuset is absent");
        assert!(err.is_not_found());
    }

    #[test]
    fn finds_unified_controller_from_cgroup_controllers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("unified");
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(root.join("cgroup.controllers"), "cpuset cpu io memory pids\n").expect("write");
        let mountinfo = dir.path().join("mountinfo");
        std::fs::write(
            &mountinfo,
            format!("30 25 0:26 / {} rw shared:4 - cgroup2 cgroup2 rw\n", root.display()),
        )
        .expect("write");

        let resolver = CgroupResolver::new(&mountinfo);
        let memory = resolver.find_hierarchy("memory").expect("memory");
        assert_eq!(memory.version, CgroupVersion::V2);
        assert!(resolver.find_hierarchy("hugetlb").is_err());
    }

    #[test]
    fn cgroup_path_respects_auto_create() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mem_root = dir.path().join("memory");
        std::fs::create_dir_all(&mem_root).expect("mkdir");
        let mountinfo = dir.path().join("mountinfo");
        std::fs::write(
            &mountinfo,
            format!("33 25 0:28 / {} rw - cgroup cgroup rw,memory\n", mem_root.display()),
        )
        .expect("write");
        let resolver = CgroupResolver::new(&mountinfo);

        let err = resolver
            .cgroup_path("memory", "capsule-1", false)
            .expect_err("not created yet");
        assert!(err.is_not_found());

        let (_, path) = resolver.cgroup_path("memory", "capsule-1", true).expect("create");
        assert!(path.is_dir());

        // A second creation of the same group is idempotent.
        let (_, again) = resolver.cgroup_path("memory", "capsule-1", true).expect("again");
        assert_eq!(path, again);
        let (_, existing) = resolver.cgroup_path("memory", "capsule-1", false).expect("exists");
        assert_eq!(path, existing);
    }
}
