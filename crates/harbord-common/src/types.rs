//! Domain primitive types used across the harbord workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{CONTAINER_ID_HEX_LENGTH, SHORT_ID_LENGTH};
use crate::error::{HarbordError, Result};

/// Unique identifier for a container instance.
///
/// Generated IDs are 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random 64-hex-character container ID.
    #[must_use]
    pub fn generate() -> Self {
        let mut id = String::with_capacity(CONTAINER_ID_HEX_LENGTH);
        while id.len() < CONTAINER_ID_HEX_LENGTH {
            id.push_str(&uuid::Uuid::new_v4().simple().to_string());
        }
        id.truncate(CONTAINER_ID_HEX_LENGTH);
        Self(id)
    }

    /// Returns `true` if the value looks like a full generated ID.
    #[must_use]
    pub fn is_full_hex(value: &str) -> bool {
        value.len() == CONTAINER_ID_HEX_LENGTH && value.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the truncated form shown in listings.
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(SHORT_ID_LENGTH)
            .map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a container image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    /// Creates a new image ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Platform an image was built for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct Platform {
    /// Operating system, e.g. `linux`.
    #[serde(default)]
    pub os: String,
    /// CPU architecture, e.g. `amd64`.
    #[serde(default)]
    pub architecture: String,
    /// Optional architecture variant, e.g. `v8`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl Platform {
    /// Returns the platform of the host the daemon runs on.
    #[must_use]
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "arm" => "arm",
            other => other,
        };
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: architecture.to_string(),
            variant: String::new(),
        }
    }
}

/// Resource limits for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceLimits {
    /// CPU shares (relative weight).
    #[serde(default)]
    pub cpu_shares: Option<u64>,
    /// Memory limit in bytes.
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    /// I/O weight (1-10000).
    #[serde(default)]
    pub io_weight: Option<u16>,
    /// Maximum number of processes.
    #[serde(default)]
    pub pids_limit: Option<i64>,
}

/// Lifecycle phase of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created but never started.
    #[default]
    Created,
    /// The task is running.
    Running,
    /// The task is frozen.
    Paused,
    /// Exited and waiting for the restart policy to start it again.
    Restarting,
    /// Removal is in progress.
    Removing,
    /// The task exited.
    Exited,
    /// Unrecoverable error, typically a failed removal.
    Dead,
}

impl ContainerStatus {
    /// Returns `true` if a task is alive in this phase.
    #[must_use]
    pub const fn has_task(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Removing => write!(f, "removing"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Health sub-status, orthogonal to the lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No healthcheck configured.
    #[default]
    None,
    /// Healthcheck configured, no verdict yet.
    Starting,
    /// Last probes succeeded.
    Healthy,
    /// Probes failed past the retry threshold.
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Kind of automatic restart behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestartPolicyMode {
    /// Never restart.
    #[default]
    #[serde(rename = "no", alias = "")]
    No,
    /// Restart on every exit unless manually stopped.
    #[serde(rename = "always")]
    Always,
    /// Restart unless manually stopped, ignoring the exit code.
    #[serde(rename = "unless-stopped")]
    UnlessStopped,
    /// Restart only on non-zero exit codes.
    #[serde(rename = "on-failure")]
    OnFailure,
}

impl fmt::Display for RestartPolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::No => write!(f, "no"),
            Self::Always => write!(f, "always"),
            Self::UnlessStopped => write!(f, "unless-stopped"),
            Self::OnFailure => write!(f, "on-failure"),
        }
    }
}

/// Restart policy of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    /// Policy kind.
    pub name: RestartPolicyMode,
    /// Maximum number of restarts for `on-failure`; 0 means unlimited.
    #[serde(default)]
    pub maximum_retry_count: u32,
}

impl RestartPolicy {
    /// Policy that never restarts.
    pub const NO: Self = Self {
        name: RestartPolicyMode::No,
        maximum_retry_count: 0,
    };

    /// Builds an `on-failure` policy with the given retry cap.
    #[must_use]
    pub const fn on_failure(maximum_retry_count: u32) -> Self {
        Self {
            name: RestartPolicyMode::OnFailure,
            maximum_retry_count,
        }
    }

    /// Builds a policy of the given kind without a retry cap.
    #[must_use]
    pub const fn of(name: RestartPolicyMode) -> Self {
        Self {
            name,
            maximum_retry_count: 0,
        }
    }

    /// Returns `true` for the `no` policy.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.name == RestartPolicyMode::No
    }

    /// Checks the policy for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if a retry count is set on a policy other
    /// than `on-failure`.
    pub fn validate(&self) -> Result<()> {
        if self.maximum_retry_count > 0 && self.name != RestartPolicyMode::OnFailure {
            return Err(HarbordError::invalid(format!(
                "invalid restart policy: maximum retry count can only be used with 'on-failure', got '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

impl FromStr for RestartPolicy {
    type Err = HarbordError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, count) = match s.split_once(':') {
            Some((name, count)) => (name, Some(count)),
            None => (s, None),
        };
        let mode = match name {
            "" | "no" => RestartPolicyMode::No,
            "always" => RestartPolicyMode::Always,
            "unless-stopped" => RestartPolicyMode::UnlessStopped,
            "on-failure" => RestartPolicyMode::OnFailure,
            other => {
                return Err(HarbordError::invalid(format!(
                    "invalid restart policy '{other}'"
                )));
            }
        };
        let maximum_retry_count = match count {
            None => 0,
            Some(_) if mode != RestartPolicyMode::OnFailure => {
                return Err(HarbordError::invalid(format!(
                    "invalid restart policy '{s}': maximum retry count can only be used with 'on-failure'"
                )));
            }
            Some(count) => count.parse::<u32>().map_err(|_| {
                HarbordError::invalid(format!(
                    "invalid restart policy '{s}': maximum retry count must be a non-negative integer"
                ))
            })?,
        };
        Ok(Self {
            name: mode,
            maximum_retry_count,
        })
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == RestartPolicyMode::OnFailure && self.maximum_retry_count > 0 {
            write!(f, "{}:{}", self.name, self.maximum_retry_count)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// Logging driver selection for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogConfig {
    /// Driver name, e.g. `json-file`, `local` or `none`.
    #[serde(rename = "Type")]
    pub driver: String,
    /// Free-form driver options.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl LogConfig {
    /// Creates a config for the named driver with no options.
    #[must_use]
    pub fn driver(name: impl Into<String>) -> Self {
        Self {
            driver: name.into(),
            config: BTreeMap::new(),
        }
    }

    /// Adds an option, returning the updated config.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.config.insert(key.into(), value.into());
        self
    }

    /// Returns the value of an option.
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::driver(crate::constants::DEFAULT_LOG_DRIVER)
    }
}
