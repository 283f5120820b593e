//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for harbord data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/harbord";

/// Returns the data directory, preferring `$HOME/.harbord` for non-root
/// or non-Linux environments, falling back to `/var/lib/harbord`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        let user_dir = PathBuf::from(home).join(".harbord");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Name of the subdirectory of the data directory holding one directory per
/// container.
pub const CONTAINERS_DIR: &str = "containers";

/// Primary container document.
pub const CONFIG_FILE_NAME: &str = "config.v2.json";
/// Host configuration document, persisted separately from the main document.
pub const HOST_CONFIG_FILE_NAME: &str = "hostconfig.json";
/// Directory for checkpoint data inside a container root.
pub const CHECKPOINTS_DIR: &str = "checkpoints";
/// Directory holding materialized mounts (secrets, configs).
pub const MOUNTS_DIR: &str = "mounts";
/// Directory used by the `local` log driver.
pub const LOCAL_LOGS_DIR: &str = "local-logs";
/// Log file name used by the `local` log driver.
pub const LOCAL_LOG_FILE: &str = "container.log";
/// Local read-back cache for write-only log drivers.
pub const CACHED_LOG_FILE: &str = "container-cached.log";

/// File mode of persisted container documents.
pub const CONFIG_FILE_MODE: u32 = 0o600;
/// File mode of a container root directory.
pub const CONTAINER_DIR_MODE: u32 = 0o700;

/// Default container stop signal.
pub const DEFAULT_STOP_SIGNAL: &str = "SIGTERM";
/// Default number of seconds to wait for a graceful stop.
pub const DEFAULT_STOP_TIMEOUT_SECS: i64 = 10;

/// Default logging driver.
pub const DEFAULT_LOG_DRIVER: &str = "json-file";
/// Default ring buffer size in non-blocking log mode (1 MiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;
/// Maximum size of a single log message before it is split into partials.
pub const MAX_LOG_MESSAGE_SIZE: usize = 16 * 1024;

/// Exit code recorded when a task failed to start.
pub const START_FAILURE_EXIT_CODE: i32 = 128;
/// Exit code recorded when a container's task vanished while the daemon was down.
pub const LOST_TASK_EXIT_CODE: i32 = 255;

/// Length of a full container ID in hex characters.
pub const CONTAINER_ID_HEX_LENGTH: usize = 64;
/// Length of the truncated container ID shown in listings.
pub const SHORT_ID_LENGTH: usize = 12;

/// Default `PATH` for Linux containers.
pub const DEFAULT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Mount point for secrets inside a container.
pub const CONTAINER_SECRET_MOUNT_PATH: &str = "/run/secrets";
/// Mount point for configs inside a container.
pub const CONTAINER_CONFIG_MOUNT_PATH: &str = "/";

/// Application name used in CLI output and logger metadata.
pub const APP_NAME: &str = "harbord";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "harbord";
