//! Runtime engine that orchestrates the container lifecycle.
//!
//! `run` walks through workspace, launch, record, cgroup and network setup,
//! remembering each completed phase. If a later phase fails, exactly the
//! completed phases are undone before the error is returned. Only then is
//! the command released to the container init.

use std::net::Ipv4Addr;

use capsule_common::config::RuntimeConfig;
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::{ContainerId, ContainerInfo, ContainerState, ResourceConfig};
use capsule_core::cgroup::{CgroupManager, CgroupResolver};
use capsule_network::{Network, NetworkRegistry};

use crate::exec::exec_in_container;
use crate::logs;
use crate::process::{self, LaunchSpec, ParentProcess};
use crate::registry::{ContainerRegistry, NewContainer, validate_name};
use crate::workspace::{OverlayWorkspace, VolumeSpec, WorkspaceProvider};

/// Parameters of `capsule run`.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Attach the container to the caller's terminal and wait for it.
    pub tty: bool,
    /// Container name; the generated id when absent.
    pub name: Option<String>,
    /// Image the root filesystem is built from.
    pub image: String,
    /// Command and arguments run inside the container.
    pub command: Vec<String>,
    /// Resource limits.
    pub resources: ResourceConfig,
    /// Volume spec `host:container`, or empty.
    pub volume: String,
    /// Extra `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Published ports, `hostPort:containerPort`.
    pub port_mapping: Vec<String>,
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The container keeps running in the background.
    Detached(ContainerInfo),
    /// A foreground container finished and was cleaned up.
    Exited {
        /// The record as it was while the container ran.
        info: ContainerInfo,
        /// Exit code of the container init.
        code: i32,
    },
}

/// One completed setup step of `run`.
#[derive(Debug, Clone)]
enum Phase {
    Workspace(Option<VolumeSpec>),
    ContainerDir,
    Process(i32),
    Record,
    Cgroup(String),
    Network {
        network: String,
        info: ContainerInfo,
        ip: Ipv4Addr,
    },
}

/// The runtime engine that coordinates all container operations.
#[derive(Debug)]
pub struct Engine {
    config: RuntimeConfig,
    containers: ContainerRegistry,
    networks: NetworkRegistry,
    workspace: Box<dyn WorkspaceProvider>,
    cgroups: CgroupResolver,
}

impl Engine {
    /// Creates an engine over the on-disk state described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted networks cannot be loaded.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let networks = NetworkRegistry::load(&config)?;
        let workspace = Box::new(OverlayWorkspace::new(&config.workspace_root));
        Ok(Self::with_components(config, networks, workspace))
    }

    /// Creates an engine with explicit collaborators.
    #[must_use]
    pub fn with_components(
        config: RuntimeConfig,
        networks: NetworkRegistry,
        workspace: Box<dyn WorkspaceProvider>,
    ) -> Self {
        Self {
            containers: ContainerRegistry::new(&config.container_dir),
            cgroups: CgroupResolver::new(&config.mountinfo),
            config,
            networks,
            workspace,
        }
    }

    /// Runtime configuration in use.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Container record store.
    #[must_use]
    pub const fn containers(&self) -> &ContainerRegistry {
        &self.containers
    }

    /// Creates and starts a container.
    ///
    /// Foreground (`tty`) runs block until the container exits and then
    /// release everything it held.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] for an empty command or bad name,
    /// [`CapsuleError::AlreadyExists`] if the name is taken,
    /// [`CapsuleError::NotFound`] for an unknown network, or the error of
    /// the first failing setup phase (after undoing the earlier ones).
    pub fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        if request.command.is_empty() {
            return Err(CapsuleError::Config {
                message: "missing container command".into(),
            });
        }
        let id = ContainerId::generate();
        let name = request
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| id.to_string());
        validate_name(&name)?;
        if self.containers.exists(&name) {
            return Err(CapsuleError::AlreadyExists {
                kind: "container",
                id: name,
            });
        }
        if let Some(network) = &request.network {
            let _ = self.networks.get(network)?;
        }

        let mut phases = Vec::new();
        let (info, process) = match self.start(request, id, &name, &mut phases) {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(container = %name, error = %e, "container setup failed");
                self.unwind(&name, phases);
                return Err(e);
            }
        };
        tracing::info!(container = %info.name, id = %info.id, pid = %info.pid, "container started");

        if !request.tty {
            return Ok(RunOutcome::Detached(info));
        }
        let waited = process.wait();
        self.finish_foreground(info, waited)
    }

    /// Tears down a foreground container whatever the outcome of waiting
    /// for it, then reports that outcome.
    fn finish_foreground(&self, info: ContainerInfo, waited: Result<i32>) -> Result<RunOutcome> {
        match &waited {
            Ok(code) => tracing::info!(container = %info.name, code, "container exited"),
            Err(e) => tracing::error!(container = %info.name, error = %e, "lost track of container"),
        }
        let released = self.release(&info);
        let deleted = self.containers.delete(&info.name);
        let code = waited?;
        released?;
        deleted?;
        Ok(RunOutcome::Exited { info, code })
    }

    fn start(
        &self,
        request: &RunRequest,
        id: ContainerId,
        name: &str,
        phases: &mut Vec<Phase>,
    ) -> Result<(ContainerInfo, ParentProcess)> {
        let volume = VolumeSpec::parse(&request.volume);
        let root = self.workspace.create(name, &request.image, volume.as_ref())?;
        phases.push(Phase::Workspace(volume));

        let log_file = if request.tty {
            None
        } else {
            drop(self.containers.create_log(name)?);
            phases.push(Phase::ContainerDir);
            Some(self.containers.log_path(name))
        };

        let mut process = process::spawn_init(&LaunchSpec {
            tty: request.tty,
            root_dir: root,
            log_file,
            env: request.env.clone(),
        })?;
        let pid = process.pid();
        phases.push(Phase::Process(pid));

        let mut info = self.containers.record(NewContainer {
            id: Some(id),
            name: Some(name.to_string()),
            pid,
            command: request.command.clone(),
            volume: request.volume.clone(),
            port_mapping: request.port_mapping.clone(),
        })?;
        phases.push(Phase::Record);

        let cgroup = CgroupManager::new(
            self.config.cgroup_name(info.id.as_str()),
            self.cgroups.clone(),
        );
        phases.push(Phase::Cgroup(cgroup.group().to_string()));
        let report = cgroup.set(&request.resources);
        report.log();
        report.into_result()?;
        let report = cgroup.apply(pid);
        report.log();
        report.into_result()?;

        if let Some(network) = &request.network {
            let endpoint = self.networks.connect(network, &info)?;
            phases.push(Phase::Network {
                network: network.clone(),
                info: info.clone(),
                ip: endpoint.ip_address,
            });
            info.network = Some(network.clone());
            info.ip = Some(endpoint.ip_address.to_string());
            self.containers.update(&info)?;
        }

        process.send_command(&request.command)?;
        Ok((info, process))
    }

    /// Undoes completed phases. The process goes first so its cgroups can
    /// be removed; the rest is undone newest first.
    fn unwind(&self, name: &str, phases: Vec<Phase>) {
        for phase in &phases {
            if let Phase::Process(pid) = phase {
                process::terminate(*pid);
            }
        }
        for phase in phases.into_iter().rev() {
            tracing::debug!(container = %name, phase = ?phase, "undoing setup phase");
            let outcome = match phase {
                Phase::Process(_) => Ok(()),
                Phase::Network { network, info, ip } => {
                    self.networks.disconnect(&network, &info, ip)
                }
                Phase::Cgroup(group) => {
                    CgroupManager::new(group, self.cgroups.clone()).destroy().into_result()
                }
                Phase::Record | Phase::ContainerDir => self.containers.delete(name),
                Phase::Workspace(volume) => self.workspace.remove(name, volume.as_ref()),
            };
            if let Err(e) = outcome {
                tracing::warn!(container = %name, error = %e, "rollback step failed");
            }
        }
    }

    /// Releases the network address, port rules, cgroups and workspace of a
    /// container that no longer runs.
    fn release(&self, info: &ContainerInfo) -> Result<()> {
        if let (Some(network), Some(ip)) = (&info.network, &info.ip) {
            match ip.parse::<Ipv4Addr>() {
                Ok(ip) => {
                    if let Err(e) = self.networks.disconnect(network, info, ip) {
                        tracing::warn!(container = %info.name, error = %e, "network release failed");
                    }
                }
                Err(e) => tracing::warn!(container = %info.name, ip = %ip, error = %e, "bad recorded ip"),
            }
        }

        let report =
            CgroupManager::new(self.config.cgroup_name(info.id.as_str()), self.cgroups.clone())
                .destroy();
        report.log();

        let volume = VolumeSpec::parse(&info.volume);
        self.workspace.remove(&info.name, volume.as_ref())
    }

    /// Sends SIGTERM to a running container and marks it stopped.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] or [`CapsuleError::InvalidState`]
    /// if the container does not exist or is not running.
    pub fn stop(&self, name: &str) -> Result<ContainerInfo> {
        self.containers.stop(name)
    }

    /// Deletes a container that is no longer running, with its workspace,
    /// cgroups and network reservation.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::InvalidState`] for a running container
    /// (nothing is deleted), [`CapsuleError::NotFound`] for an unknown one,
    /// or the error of removing its workspace.
    pub fn remove(&self, name: &str) -> Result<ContainerInfo> {
        let info = self.containers.remove(name)?;
        self.release(&info)?;
        Ok(info)
    }

    /// Runs a command inside a running container and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::InvalidState`] if the container is not
    /// running, or the error of starting the command.
    pub fn exec(&self, name: &str, command: &[String]) -> Result<i32> {
        let info = self.containers.get(name)?;
        let pid = info
            .host_pid()
            .filter(|_| info.status == ContainerState::Running)
            .ok_or_else(|| CapsuleError::InvalidState {
                message: format!("container {name} is not running"),
            })?;
        exec_in_container(pid, command)
    }

    /// Returns a container's log, optionally only the last `tail` lines.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] for an unknown container.
    pub fn logs(&self, name: &str, tail: Option<usize>) -> Result<String> {
        let _ = self.containers.get(name)?;
        let path = self.containers.log_path(name);
        match tail {
            Some(lines) => logs::tail_logs(&path, lines),
            None => logs::read_logs(&path),
        }
    }

    /// Lists all containers.
    ///
    /// # Errors
    ///
    /// Returns an error if the container directory cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerInfo>> {
        self.containers.list()
    }

    /// Creates a network.
    ///
    /// # Errors
    ///
    /// See [`NetworkRegistry::create_network`].
    pub fn create_network(&mut self, driver: &str, subnet: &str, name: &str) -> Result<Network> {
        self.networks.create_network(driver, subnet, name)
    }

    /// Removes a network no running container is attached to.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::InvalidState`] while a running container
    /// uses the network, otherwise see [`NetworkRegistry::delete_network`].
    pub fn remove_network(&mut self, name: &str) -> Result<()> {
        let users: Vec<String> = self
            .containers
            .list()?
            .into_iter()
            .filter(|c| c.status == ContainerState::Running && c.network.as_deref() == Some(name))
            .map(|c| c.name)
            .collect();
        if !users.is_empty() {
            return Err(CapsuleError::InvalidState {
                message: format!("network {name} is in use by {}", users.join(", ")),
            });
        }
        self.networks.delete_network(name)
    }

    /// All networks, ordered by name.
    #[must_use]
    pub fn networks(&self) -> Vec<Network> {
        self.networks.networks().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use capsule_network::Ipam;
    use capsule_network::configurator::NetnsConfigurator;

    use super::*;

    #[derive(Debug, Default, Clone)]
    struct FakeWorkspace {
        removed: Arc<Mutex<Vec<String>>>,
    }

    impl WorkspaceProvider for FakeWorkspace {
        fn create(&self, name: &str, _image: &str, _volume: Option<&VolumeSpec>) -> Result<PathBuf> {
            Ok(PathBuf::from("/nonexistent").join(name))
        }

        fn remove(&self, name: &str, _volume: Option<&VolumeSpec>) -> Result<()> {
            self.removed.lock().expect("lock").push(name.to_string());
            Ok(())
        }
    }

    fn engine(root: &Path, workspace: FakeWorkspace) -> Engine {
        let config = RuntimeConfig::with_root(root).with_mountinfo(root.join("mountinfo"));
        std::fs::write(&config.mountinfo, "").expect("mountinfo");
        let networks = NetworkRegistry::with_components(
            &config.network_dir,
            Ipam::new(&config.ipam_file),
            Vec::new(),
            Box::new(NetnsConfigurator::default()),
        )
        .expect("networks");
        Engine::with_components(config, networks, Box::new(workspace))
    }

    fn record(engine: &Engine, name: &str, pid: i32) -> ContainerInfo {
        engine
            .containers()
            .record(NewContainer {
                name: Some(name.into()),
                pid,
                command: vec!["sleep".into(), "60".into()],
                ..NewContainer::default()
            })
            .expect("record")
    }

    #[test]
    fn empty_command_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path(), FakeWorkspace::default());
        let err = engine.run(&RunRequest::default()).expect_err("empty");
        assert!(matches!(err, CapsuleError::Config { .. }));
    }

    #[test]
    fn taken_name_is_rejected_before_setup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = FakeWorkspace::default();
        let engine = engine(dir.path(), ws.clone());
        let _ = record(&engine, "web", i32::MAX);
        let err = engine
            .run(&RunRequest {
                name: Some("web".into()),
                command: vec!["top".into()],
                ..RunRequest::default()
            })
            .expect_err("taken");
        assert!(matches!(err, CapsuleError::AlreadyExists { .. }));
        assert!(ws.removed.lock().expect("lock").is_empty());
    }

    #[test]
    fn unknown_network_is_rejected_before_setup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path(), FakeWorkspace::default());
        let err = engine
            .run(&RunRequest {
                command: vec!["top".into()],
                network: Some("nope".into()),
                ..RunRequest::default()
            })
            .expect_err("network");
        assert!(err.is_not_found());
    }

    #[test]
    fn unwind_undoes_completed_phases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = FakeWorkspace::default();
        let engine = engine(dir.path(), ws.clone());
        let _ = record(&engine, "web", i32::MAX);

        engine.unwind(
            "web",
            vec![
                Phase::Workspace(None),
                Phase::ContainerDir,
                Phase::Process(i32::MAX),
                Phase::Record,
                Phase::Cgroup("capsule-test".into()),
            ],
        );
        assert!(!engine.containers().exists("web"));
        assert_eq!(*ws.removed.lock().expect("lock"), ["web"]);
    }

    #[test]
    fn foreground_teardown_runs_when_wait_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = FakeWorkspace::default();
        let engine = engine(dir.path(), ws.clone());
        let info = record(&engine, "web", i32::MAX);

        let err = engine
            .finish_foreground(
                info,
                Err(CapsuleError::InvalidState {
                    message: "waitpid failed".into(),
                }),
            )
            .expect_err("wait error");
        assert!(matches!(err, CapsuleError::InvalidState { .. }));
        assert!(!engine.containers().exists("web"));
        assert_eq!(*ws.removed.lock().expect("lock"), ["web"]);
    }

    #[test]
    fn foreground_teardown_reports_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = FakeWorkspace::default();
        let engine = engine(dir.path(), ws.clone());
        let info = record(&engine, "web", i32::MAX);

        let outcome = engine.finish_foreground(info, Ok(3)).expect("finish");
        assert!(matches!(outcome, RunOutcome::Exited { code: 3, .. }));
        assert!(!engine.containers().exists("web"));
    }

    #[test]
    fn remove_refuses_running_and_keeps_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = FakeWorkspace::default();
        let engine = engine(dir.path(), ws.clone());
        let pid = i32::try_from(std::process::id()).expect("pid");
        let _ = record(&engine, "web", pid);

        let err = engine.remove("web").expect_err("running");
        assert!(matches!(err, CapsuleError::InvalidState { .. }));
        assert!(engine.containers().exists("web"));
        assert!(ws.removed.lock().expect("lock").is_empty());
    }

    #[test]
    fn remove_of_exited_container_releases_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = FakeWorkspace::default();
        let engine = engine(dir.path(), ws.clone());
        let _ = record(&engine, "web", i32::MAX);
        assert_eq!(engine.list().expect("list")[0].status, ContainerState::Exited);

        let info = engine.remove("web").expect("remove");
        assert_eq!(info.name, "web");
        assert!(!engine.containers().exists("web"));
        assert_eq!(*ws.removed.lock().expect("lock"), ["web"]);
    }

    #[test]
    fn exec_requires_running_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path(), FakeWorkspace::default());
        let _ = record(&engine, "web", i32::MAX);
        let _ = engine.list().expect("refresh");
        let err = engine.exec("web", &["ls".into()]).expect_err("exited");
        assert!(matches!(err, CapsuleError::InvalidState { .. }));
    }

    #[test]
    fn logs_of_unknown_container_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path(), FakeWorkspace::default());
        assert!(engine.logs("ghost", None).expect_err("missing").is_not_found());

        let _ = record(&engine, "web", i32::MAX);
        std::fs::write(engine.containers().log_path("web"), "a\nb\n").expect("write");
        assert_eq!(engine.logs("web", None).expect("logs"), "a\nb\n");
        assert_eq!(engine.logs("web", Some(1)).expect("tail"), "b\n");
    }

    #[test]
    fn unknown_network_cannot_be_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = engine(dir.path(), FakeWorkspace::default());
        assert!(engine.remove_network("nope").expect_err("missing").is_not_found());
        assert!(engine.networks().is_empty());
    }
}
