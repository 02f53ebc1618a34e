//! Scoped entry into another process's network namespace.
//!
//! Namespace membership is per thread. [`run_in_netns`] therefore does its
//! work on a dedicated scoped thread that holds a [`NetnsGuard`]; the guard
//! switches back on drop, and the thread ends with the scope either way, so
//! the caller's thread never changes namespace.

use std::fs::File;

use capsule_common::error::{CapsuleError, Result};

/// Opens the network namespace handle of `pid`.
///
/// # Errors
///
/// Returns [`CapsuleError::Io`] (not found) if the process is gone.
pub fn open_netns(pid: i32) -> Result<File> {
    let path = super::NamespaceKind::Net.proc_path(pid);
    File::open(&path).map_err(|e| CapsuleError::io(path, e))
}

/// RAII guard: the current thread sits in a borrowed network namespace
/// until the guard is dropped.
#[derive(Debug)]
pub struct NetnsGuard {
    original: File,
    pid: i32,
}

#[cfg(target_os = "linux")]
impl NetnsGuard {
    /// Switches the calling thread into `pid`'s network namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if either namespace handle cannot be opened or the
    /// kernel refuses the switch.
    pub fn enter(pid: i32) -> Result<Self> {
        let own = std::path::Path::new("/proc/thread-self/ns/net");
        let original = File::open(own).map_err(|e| CapsuleError::io(own, e))?;
        let target = open_netns(pid)?;
        nix::sched::setns(&target, nix::sched::CloneFlags::CLONE_NEWNET).map_err(|e| {
            CapsuleError::PermissionDenied {
                message: format!("entering network namespace of pid {pid} failed: {e}"),
            }
        })?;
        tracing::debug!(pid, "entered network namespace");
        Ok(Self { original, pid })
    }
}

#[cfg(target_os = "linux")]
impl Drop for NetnsGuard {
    fn drop(&mut self) {
        match nix::sched::setns(&self.original, nix::sched::CloneFlags::CLONE_NEWNET) {
            Ok(()) => tracing::debug!(pid = self.pid, "restored network namespace"),
            Err(e) => tracing::error!(pid = self.pid, error = %e, "failed to restore network namespace"),
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl NetnsGuard {
    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error: network namespaces require Linux.
    pub fn enter(_pid: i32) -> Result<Self> {
        Err(CapsuleError::Config {
            message: "Linux required for native container operations".into(),
        })
    }
}

/// Runs `f` inside `pid`'s network namespace and returns its result.
///
/// # Errors
///
/// Returns the error from entering the namespace or from `f`, or
/// [`CapsuleError::InvalidState`] if `f` panicked.
pub fn run_in_netns<T, F>(pid: i32, f: F) -> Result<T>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    std::thread::scope(|scope| {
        scope
            .spawn(move || {
                let _guard = NetnsGuard::enter(pid)?;
                f()
            })
            .join()
            .map_err(|_| CapsuleError::InvalidState {
                message: format!("network namespace worker for pid {pid} panicked"),
            })?
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_process_has_no_netns() {
        let err = open_netns(i32::MAX).expect_err("no such pid");
        assert!(err.is_not_found());
    }

    #[test]
    fn closure_is_not_run_when_entry_fails() {
        let mut ran = false;
        let result = run_in_netns(i32::MAX, || {
            ran = true;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!ran);
    }
}
