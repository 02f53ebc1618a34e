//! System-wide constants and default paths.

/// Default directory holding one sub-directory per container record.
pub const DEFAULT_CONTAINER_DIR: &str = "/var/run/capsule/containers";

/// Default directory holding one JSON file per network.
pub const DEFAULT_NETWORK_DIR: &str = "/var/run/capsule/network/network";

/// Default IPAM allocation file.
pub const DEFAULT_IPAM_FILE: &str = "/var/run/capsule/network/ipam/subnet.json";

/// Default root for images, write layers and mount points.
pub const DEFAULT_WORKSPACE_ROOT: &str = "/var/lib/capsule";

/// Mount table consulted when locating cgroup hierarchies.
pub const DEFAULT_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Prefix of every cgroup created by the runtime.
pub const CGROUP_PREFIX: &str = "capsule";

/// Name of the per-container record file.
pub const CONFIG_NAME: &str = "config.json";

/// Name of the per-container log file.
pub const CONTAINER_LOG_FILE: &str = "container.log";

/// Length of generated container IDs (decimal digits).
pub const CONTAINER_ID_LENGTH: usize = 10;

/// Descriptor slot under which the init process finds the command pipe.
pub const INIT_PIPE_FD: i32 = 3;

/// Environment variable carrying the target pid of an exec re-invocation.
pub const ENV_EXEC_PID: &str = "CAPSULE_EXEC_PID";

/// Environment variable carrying the command of an exec re-invocation.
pub const ENV_EXEC_CMD: &str = "CAPSULE_EXEC_CMD";

/// Kernel limit on interface names, excluding the trailing NUL.
pub const MAX_IFNAME_LEN: usize = 15;

/// Name of the only network driver shipped with the runtime.
pub const BRIDGE_DRIVER: &str = "bridge";

/// Application name used in CLI output.
pub const APP_NAME: &str = "capsule";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "capsule";
