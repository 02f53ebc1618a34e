//! On-disk container records.
//!
//! Each container owns `<container_dir>/<name>/config.json`; the file is the
//! only source of truth, read and rewritten by every CLI invocation. Record
//! mutations run under the record's advisory lock.

use std::fs::File;
use std::path::{Path, PathBuf};

use capsule_common::constants::{CONFIG_NAME, CONTAINER_LOG_FILE};
use capsule_common::error::{CapsuleError, Result};
use capsule_common::store;
use capsule_common::types::{ContainerId, ContainerInfo, ContainerState};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Timestamp format of [`ContainerInfo::created_time`].
pub const CREATED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Everything needed to build a fresh record.
#[derive(Debug, Clone, Default)]
pub struct NewContainer {
    /// Pre-generated id; one is generated when absent.
    pub id: Option<ContainerId>,
    /// Requested name; the id is used when absent.
    pub name: Option<String>,
    /// Host pid of the container init process.
    pub pid: i32,
    /// Command line run in the container.
    pub command: Vec<String>,
    /// Volume spec as given by the user.
    pub volume: String,
    /// Published ports.
    pub port_mapping: Vec<String>,
}

/// Directory of container records.
#[derive(Debug, Clone)]
pub struct ContainerRegistry {
    dir: PathBuf,
}

impl ContainerRegistry {
    /// Creates a registry rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding one sub-directory per container.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory of one container.
    #[must_use]
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Record file of one container.
    #[must_use]
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(CONFIG_NAME)
    }

    /// Log file of one container.
    #[must_use]
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(CONTAINER_LOG_FILE)
    }

    /// Returns `true` if a record exists under `name`.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.config_path(name).exists()
    }

    /// Creates (truncating) the log file a detached container writes to.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn create_log(&self, name: &str) -> Result<File> {
        let path = self.log_path(name);
        store::ensure_parent(&path)?;
        File::create(&path).map_err(|e| CapsuleError::io(&path, e))
    }

    /// Builds and persists the record of a freshly started container.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::AlreadyExists`] if the name is taken, or a
    /// store error.
    pub fn record(&self, new: NewContainer) -> Result<ContainerInfo> {
        let id = new.id.unwrap_or_else(ContainerId::generate);
        let name = new
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| id.to_string());
        validate_name(&name)?;

        let info = ContainerInfo {
            id,
            pid: new.pid.to_string(),
            name,
            command: new.command.join(" "),
            created_time: chrono::Local::now().format(CREATED_TIME_FORMAT).to_string(),
            status: ContainerState::Running,
            volume: new.volume,
            port_mapping: new.port_mapping,
            network: None,
            ip: None,
        };

        let path = self.config_path(&info.name);
        let _lock = store::lock_exclusive(&path)?;
        if path.exists() {
            return Err(CapsuleError::AlreadyExists {
                kind: "container",
                id: info.name,
            });
        }
        store::write_json(&path, &info)?;
        tracing::info!(id = %info.id, name = %info.name, pid = %info.pid, "container recorded");
        Ok(info)
    }

    /// Reads one record.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if there is no such container.
    pub fn get(&self, name: &str) -> Result<ContainerInfo> {
        store::read_json(&self.config_path(name))?.ok_or_else(|| CapsuleError::NotFound {
            kind: "container",
            id: name.to_string(),
        })
    }

    /// Rewrites an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if the record vanished, or a store
    /// error.
    pub fn update(&self, info: &ContainerInfo) -> Result<()> {
        let path = self.config_path(&info.name);
        let _lock = store::lock_exclusive(&path)?;
        if !path.exists() {
            return Err(CapsuleError::NotFound {
                kind: "container",
                id: info.name.clone(),
            });
        }
        store::write_json(&path, info)
    }

    /// All records, ordered by name.
    ///
    /// Records marked running whose process no longer exists are rewritten
    /// as exited before being returned. Unreadable records are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the container directory cannot be listed.
    pub fn list(&self) -> Result<Vec<ContainerInfo>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CapsuleError::io(&self.dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CapsuleError::io(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && entry.path().is_dir() {
                names.push(name);
            }
        }
        names.sort();

        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            match self.refresh(&name) {
                Ok(Some(info)) => infos.push(info),
                Ok(None) => {}
                Err(e) => tracing::warn!(container = %name, error = %e, "skipping unreadable record"),
            }
        }
        Ok(infos)
    }

    /// Sends SIGTERM to a running container and marks it stopped.
    ///
    /// Does not wait for the process to exit. A process that is already
    /// gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown container,
    /// [`CapsuleError::InvalidState`] if it is not running, or
    /// [`CapsuleError::PermissionDenied`] if the signal is refused.
    pub fn stop(&self, name: &str) -> Result<ContainerInfo> {
        let path = self.config_path(name);
        let _lock = store::lock_exclusive(&path)?;
        let mut info = self.get(name)?;
        if info.status != ContainerState::Running {
            return Err(CapsuleError::InvalidState {
                message: format!("container {name} is {}, not running", info.status),
            });
        }

        if let Some(pid) = info.host_pid() {
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => tracing::info!(container = %name, pid, "sent SIGTERM"),
                Err(Errno::ESRCH) => tracing::warn!(container = %name, pid, "process already gone"),
                Err(e) => {
                    return Err(CapsuleError::PermissionDenied {
                        message: format!("signalling pid {pid} failed: {e}"),
                    });
                }
            }
        }

        info.status = ContainerState::Stopped;
        info.pid = String::new();
        store::write_json(&path, &info)?;
        Ok(info)
    }

    /// Deletes the record and log of a container that is no longer running.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown container or
    /// [`CapsuleError::InvalidState`] if it is still running; nothing is
    /// deleted in either case.
    pub fn remove(&self, name: &str) -> Result<ContainerInfo> {
        let path = self.config_path(name);
        let _lock = store::lock_exclusive(&path)?;
        let info = self.get(name)?;
        ensure_removable(&info)?;
        self.delete_dir(name)?;
        tracing::info!(container = %name, "container record removed");
        Ok(info)
    }

    /// Deletes a container's directory regardless of its status.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.delete_dir(name)
    }

    fn delete_dir(&self, name: &str) -> Result<()> {
        let dir = self.container_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapsuleError::io(&dir, e)),
        }
    }

    fn refresh(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let path = self.config_path(name);
        let Some(info) = store::read_json::<ContainerInfo>(&path)? else {
            return Ok(None);
        };
        if info.status != ContainerState::Running || info.host_pid().is_some_and(is_alive) {
            return Ok(Some(info));
        }

        let _lock = store::lock_exclusive(&path)?;
        let Some(mut info) = store::read_json::<ContainerInfo>(&path)? else {
            return Ok(None);
        };
        if info.status == ContainerState::Running && !info.host_pid().is_some_and(is_alive) {
            tracing::info!(container = %name, pid = %info.pid, "container process exited");
            info.status = ContainerState::Exited;
            store::write_json(&path, &info)?;
        }
        Ok(Some(info))
    }
}

/// Refuses removal of a container that is still marked running.
///
/// # Errors
///
/// Returns [`CapsuleError::InvalidState`] for a running container.
pub fn ensure_removable(info: &ContainerInfo) -> Result<()> {
    if info.status == ContainerState::Running {
        return Err(CapsuleError::InvalidState {
            message: format!("container {} is running; stop it first", info.name),
        });
    }
    Ok(())
}

/// Checks that `name` is usable as a record directory name.
///
/// # Errors
///
/// Returns [`CapsuleError::Config`] for empty, hidden or path-like names.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains('/') || name.contains('\0') {
        return Err(CapsuleError::Config {
            message: format!("invalid container name {name:?}"),
        });
    }
    Ok(())
}

/// Returns `true` while `pid` names an existing process.
#[must_use]
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}
