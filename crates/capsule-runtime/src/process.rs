//! Isolated process launch and the init handoff pipe.
//!
//! [`spawn_init`] clones a child into fresh UTS, PID, mount, network, IPC
//! and user namespaces. The child waits until the parent has written its
//! uid/gid maps, then re-executes the current binary as `init` with the
//! read end of the command pipe on descriptor 3. Init blocks on that pipe,
//! so the parent can apply cgroup limits and network configuration to the
//! pid before any user code runs. [`ParentProcess::send_command`] writes the
//! command and closes the pipe; EOF is the go signal.

use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use capsule_common::constants::INIT_PIPE_FD;
use capsule_common::error::{CapsuleError, Result};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

/// Path used to re-execute the running binary.
pub const SELF_EXE: &str = "/proc/self/exe";

/// Verb the re-executed binary is started with.
pub const INIT_VERB: &str = "init";

/// Stack handed to `clone(2)` for the pre-exec child.
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// How the container process is started.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Inherit the caller's terminal instead of logging to a file.
    pub tty: bool,
    /// Directory that becomes the container root.
    pub root_dir: PathBuf,
    /// Log file receiving stdout and stderr when `tty` is false.
    pub log_file: Option<PathBuf>,
    /// Extra `KEY=VALUE` entries appended to the inherited environment.
    pub env: Vec<String>,
}

/// A launched container process still waiting for its command.
#[derive(Debug)]
pub struct ParentProcess {
    pid: Pid,
    command_pipe: Option<File>,
}

impl ParentProcess {
    /// Host pid of the container init.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Writes the space-joined command and closes the pipe.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::InvalidState`] if the command was already
    /// sent, or an I/O error if the write fails.
    pub fn send_command(&mut self, command: &[String]) -> Result<()> {
        let mut pipe = self.command_pipe.take().ok_or_else(|| CapsuleError::InvalidState {
            message: "container command already sent".into(),
        })?;
        let line = command.join(" ");
        pipe.write_all(line.as_bytes())
            .map_err(|e| CapsuleError::io(format!("/proc/{}/fd/{INIT_PIPE_FD}", self.pid), e))?;
        tracing::info!(pid = %self.pid, command = %line, "command sent to container init");
        Ok(())
    }

    /// Blocks until the container init exits and returns its exit code.
    ///
    /// A process killed by a signal reports `128 + signal`.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::InvalidState`] if the pid cannot be waited for.
    pub fn wait(&self) -> Result<i32> {
        wait_for_exit(self.pid)
    }

    /// Kills the container init and reaps it.
    pub fn kill(&mut self) {
        drop(self.command_pipe.take());
        terminate(self.pid.as_raw());
    }
}

/// Sends SIGKILL to `pid` and reaps it if it is our child.
pub fn terminate(pid: i32) {
    if pid <= 0 {
        return;
    }
    let pid = Pid::from_raw(pid);
    match kill(pid, Signal::SIGKILL) {
        Ok(()) => {
            let _ = waitpid(pid, None);
            tracing::info!(pid = %pid, "container process killed");
        }
        Err(e) => tracing::warn!(pid = %pid, error = %e, "kill failed"),
    }
}

/// Waits for `pid` to exit, returning its exit code.
fn wait_for_exit(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) | Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                return Err(CapsuleError::InvalidState {
                    message: format!("waiting for pid {pid} failed: {e}"),
                });
            }
        }
    }
}

/// Environment for the container: the caller's plus well-formed `extra`
/// entries. Entries without `=` are logged and skipped.
#[must_use]
pub fn container_env(extra: &[String]) -> Vec<String> {
    let mut env: Vec<String> = std::env::vars_os()
        .filter_map(|(k, v)| Some(format!("{}={}", k.to_str()?, v.to_str()?)))
        .collect();
    for entry in extra {
        match entry.split_once('=') {
            Some((key, _)) if !key.is_empty() => env.push(entry.clone()),
            _ => tracing::warn!(entry = %entry, "skipping malformed environment entry"),
        }
    }
    env
}

/// Pre-exec state of the cloned child. Everything is prepared by the parent
/// so the child only issues raw syscalls.
#[cfg(target_os = "linux")]
struct ChildContext {
    sync_read: std::os::fd::RawFd,
    sync_write: std::os::fd::RawFd,
    init_read: std::os::fd::RawFd,
    stdin: Option<std::os::fd::RawFd>,
    log: Option<std::os::fd::RawFd>,
    root_dir: CString,
    exe: CString,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
}

#[cfg(target_os = "linux")]
impl ChildContext {
    /// Body of the cloned child; never returns on success.
    ///
    /// # Safety
    ///
    /// Must only run in the freshly cloned child, where the raw descriptors
    /// and pointer arrays prepared by the parent are valid copies.
    unsafe fn run(&self) -> isize {
        // SAFETY: only async-signal-safe libc calls on descriptors and
        // NUL-terminated buffers owned by this (copied) context.
        unsafe {
            let _ = libc::close(self.sync_write);
            let mut go = 0_u8;
            loop {
                let n = libc::read(self.sync_read, (&raw mut go).cast(), 1);
                if n == 1 {
                    break;
                }
                if n < 0 && nix::errno::Errno::last() == nix::errno::Errno::EINTR {
                    continue;
                }
                libc::_exit(1);
            }
            let _ = libc::close(self.sync_read);
            if go != b'1' {
                libc::_exit(1);
            }

            if libc::dup2(self.init_read, INIT_PIPE_FD) < 0
                || libc::fcntl(INIT_PIPE_FD, libc::F_SETFD, 0) < 0
            {
                fail(b"capsule: cannot install init pipe\n");
            }
            if let Some(fd) = self.stdin {
                if libc::dup2(fd, libc::STDIN_FILENO) < 0 {
                    fail(b"capsule: cannot redirect stdin\n");
                }
            }
            if let Some(fd) = self.log {
                if libc::dup2(fd, libc::STDOUT_FILENO) < 0 || libc::dup2(fd, libc::STDERR_FILENO) < 0 {
                    fail(b"capsule: cannot redirect output to log\n");
                }
            }
            if libc::chdir(self.root_dir.as_ptr()) < 0 {
                fail(b"capsule: cannot enter container root\n");
            }
            let _ = libc::execve(self.exe.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr());
            fail(b"capsule: cannot re-execute for init\n")
        }
    }
}

/// Reports a pre-exec failure on stderr and exits the child.
///
/// # Safety
///
/// Only for use in the cloned child.
#[cfg(target_os = "linux")]
unsafe fn fail(message: &[u8]) -> ! {
    // SAFETY: write(2) and _exit(2) are async-signal-safe.
    unsafe {
        let _ = libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
        libc::_exit(127)
    }
}

fn cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| CapsuleError::Config {
        message: format!("{value:?} contains a NUL byte"),
    })
}

/// Launches the container init process in new namespaces.
///
/// The returned process is blocked on its command pipe; call
/// [`ParentProcess::send_command`] once limits and networking are in place.
///
/// # Errors
///
/// Returns an error if the pipes, the log file or `clone(2)` fail, or if
/// the id maps cannot be written (the child is killed in that case).
#[cfg(target_os = "linux")]
pub fn spawn_init(spec: &LaunchSpec) -> Result<ParentProcess> {
    use std::os::fd::AsRawFd;

    use capsule_core::namespace::NamespaceConfig;
    use capsule_core::namespace::user::write_id_maps;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;

    let os_err = |what: &str, e: nix::Error| CapsuleError::PermissionDenied {
        message: format!("{what} failed: {e}"),
    };

    let (init_read, init_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| os_err("pipe2", e))?;
    let (sync_read, sync_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| os_err("pipe2", e))?;

    let log = match (&spec.log_file, spec.tty) {
        (Some(path), false) => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| CapsuleError::io(path, e))?,
        ),
        _ => None,
    };
    let stdin = if spec.tty {
        None
    } else {
        Some(File::open("/dev/null").map_err(|e| CapsuleError::io("/dev/null", e))?)
    };

    let root_dir = cstring(&spec.root_dir.to_string_lossy())?;
    let exe = cstring(SELF_EXE)?;
    let args = [cstring(SELF_EXE)?, cstring(INIT_VERB)?];
    let env = container_env(&spec.env)
        .iter()
        .map(|e| cstring(e))
        .collect::<Result<Vec<_>>>()?;

    let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());
    let mut envp: Vec<*const libc::c_char> = env.iter().map(|e| e.as_ptr()).collect();
    envp.push(std::ptr::null());

    let context = ChildContext {
        sync_read: sync_read.as_raw_fd(),
        sync_write: sync_write.as_raw_fd(),
        init_read: init_read.as_raw_fd(),
        stdin: stdin.as_ref().map(AsRawFd::as_raw_fd),
        log: log.as_ref().map(AsRawFd::as_raw_fd),
        root_dir,
        exe,
        argv,
        envp,
    };

    let flags = NamespaceConfig::default().clone_flags();
    let mut stack = vec![0_u8; CHILD_STACK_SIZE];
    // SAFETY: without CLONE_VM the child runs on a private copy of this
    // address space, and its callback sticks to raw syscalls until execve.
    let pid = unsafe {
        nix::sched::clone(
            Box::new(|| context.run()),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| os_err("clone", e))?;
    drop((init_read, sync_read, log, stdin));

    let mut process = ParentProcess {
        pid,
        command_pipe: Some(File::from(init_write)),
    };

    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    if let Err(e) = write_id_maps(pid.as_raw(), uid, gid) {
        drop(sync_write);
        process.kill();
        return Err(e);
    }
    let mut sync = File::from(sync_write);
    if let Err(e) = sync.write_all(b"1") {
        process.kill();
        return Err(CapsuleError::io("sync pipe", e));
    }
    drop(sync);

    tracing::info!(
        pid = %pid,
        tty = spec.tty,
        root = %spec.root_dir.display(),
        "container process launched"
    );
    Ok(process)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: containers require Linux.
#[cfg(not(target_os = "linux"))]
pub fn spawn_init(_spec: &LaunchSpec) -> Result<ParentProcess> {
    Err(CapsuleError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Reads the command handed over on the init pipe.
///
/// Reads to EOF and splits on whitespace.
///
/// # Errors
///
/// Returns an I/O error if the descriptor cannot be read, or
/// [`CapsuleError::Config`] if the command is empty.
pub fn read_command() -> Result<Vec<String>> {
    use std::os::fd::FromRawFd;

    // SAFETY: descriptor 3 is installed by the launcher for this process
    // and owned by nothing else; the File takes ownership and closes it.
    let pipe = unsafe { File::from_raw_fd(INIT_PIPE_FD) };
    read_command_from(pipe)
}

/// Reads a whitespace-separated command from `reader` until EOF.
///
/// # Errors
///
/// Returns an I/O error on read failure, or [`CapsuleError::Config`] if the
/// command is empty.
pub fn read_command_from(mut reader: impl Read) -> Result<Vec<String>> {
    let mut raw = Vec::new();
    let _ = reader
        .read_to_end(&mut raw)
        .map_err(|e| CapsuleError::io(format!("fd {INIT_PIPE_FD}"), e))?;
    let command: Vec<String> = String::from_utf8_lossy(&raw)
        .split_whitespace()
        .map(String::from)
        .collect();
    if command.is_empty() {
        return Err(CapsuleError::Config {
            message: "no command received on the init pipe".into(),
        });
    }
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_is_split_on_whitespace() {
        let cmd = read_command_from(&b"sh -c  top\n"[..]).expect("read");
        assert_eq!(cmd, ["sh", "-c", "top"]);
    }

    #[test]
    fn empty_pipe_is_an_error() {
        let err = read_command_from(&b"  \n"[..]).expect_err("empty");
        assert!(matches!(err, CapsuleError::Config { .. }));
    }

    #[test]
    fn malformed_env_entries_are_dropped() {
        let env = container_env(&["A=1".into(), "broken".into(), "=x".into(), "B=".into()]);
        assert!(env.contains(&"A=1".to_string()));
        assert!(env.contains(&"B=".to_string()));
        assert!(!env.iter().any(|e| e == "broken" || e == "=x"));
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(cstring("a\0b").is_err());
        assert!(cstring("/proc/self/exe").is_ok());
    }

    #[test]
    fn send_command_writes_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pipe");
        let mut process = ParentProcess {
            pid: Pid::from_raw(i32::MAX),
            command_pipe: Some(File::create(&path).expect("create")),
        };
        process
            .send_command(&["echo".into(), "hi".into()])
            .expect("send");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "echo hi");
        assert!(process.send_command(&["again".into()]).is_err());
    }
}
