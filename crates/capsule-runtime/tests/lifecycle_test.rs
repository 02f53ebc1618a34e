//! Stop and remove against real processes and on-disk state.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use capsule_common::config::RuntimeConfig;
use capsule_common::error::{CapsuleError, Result};
use capsule_common::types::ContainerState;
use capsule_network::configurator::NetnsConfigurator;
use capsule_network::{Ipam, NetworkRegistry};
use capsule_runtime::Engine;
use capsule_runtime::registry::NewContainer;
use capsule_runtime::workspace::{VolumeSpec, WorkspaceProvider};

#[derive(Debug)]
struct NoWorkspace;

impl WorkspaceProvider for NoWorkspace {
    fn create(&self, name: &str, _image: &str, _volume: Option<&VolumeSpec>) -> Result<PathBuf> {
        Ok(PathBuf::from(name))
    }

    fn remove(&self, _name: &str, _volume: Option<&VolumeSpec>) -> Result<()> {
        Ok(())
    }
}

fn engine(root: &Path) -> Engine {
    let config = RuntimeConfig::with_root(root).with_mountinfo(root.join("mountinfo"));
    std::fs::write(&config.mountinfo, "").expect("mountinfo");
    let networks = NetworkRegistry::with_components(
        &config.network_dir,
        Ipam::new(&config.ipam_file),
        Vec::new(),
        Box::new(NetnsConfigurator::default()),
    )
    .expect("networks");
    Engine::with_components(config, networks, Box::new(NoWorkspace))
}

fn start(engine: &Engine, name: &str) -> Child {
    let child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
    let _ = engine
        .containers()
        .record(NewContainer {
            name: Some(name.into()),
            pid: i32::try_from(child.id()).expect("pid"),
            command: vec!["sleep".into(), "30".into()],
            ..NewContainer::default()
        })
        .expect("record");
    child
}

#[test]
fn stop_then_remove_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(dir.path());
    let mut child = start(&engine, "sleeper");

    let stopped = engine.stop("sleeper").expect("stop");
    assert_eq!(stopped.status, ContainerState::Stopped);
    assert!(stopped.pid.is_empty());
    let status = child.wait().expect("wait");
    assert!(!status.success());

    let listed = engine.list().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, ContainerState::Stopped);

    let removed = engine.remove("sleeper").expect("remove");
    assert_eq!(removed.name, "sleeper");
    assert!(engine.list().expect("list").is_empty());
    assert!(!dir.path().join("containers/sleeper").exists());
}

#[test]
fn remove_of_running_container_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(dir.path());
    let mut child = start(&engine, "busy");

    let err = engine.remove("busy").expect_err("running");
    assert!(matches!(err, CapsuleError::InvalidState { .. }));
    assert!(dir.path().join("containers/busy/config.json").exists());
    assert_eq!(engine.list().expect("list")[0].status, ContainerState::Running);

    child.kill().expect("kill");
    let _ = child.wait();
}

#[test]
fn second_stop_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(dir.path());
    let mut child = start(&engine, "once");

    let _ = engine.stop("once").expect("stop");
    let _ = child.wait();
    let err = engine.stop("once").expect_err("already stopped");
    assert!(matches!(err, CapsuleError::InvalidState { .. }));
}
