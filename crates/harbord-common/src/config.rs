//! Global configuration model for the harbord daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarbordError, Result};
use crate::types::LogConfig;

/// Root configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// Base directory for harbord state and data.
    pub data_dir: PathBuf,
    /// Log driver applied to containers that do not configure one.
    pub default_log_config: LogConfig,
    /// Delay curve for policy-driven restarts.
    pub restart_backoff: BackoffConfig,
    /// Deadline applied to every call into the container runtime.
    pub runtime_timeout_secs: u64,
    /// Stop timeout used when neither the request nor the container sets one.
    pub default_stop_timeout_secs: i64,
    /// Interval between streamed stats samples.
    pub stats_interval_ms: u64,
    /// How long an exiting container waits for its log copier to drain.
    pub copier_drain_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::constants::data_dir().clone(),
            default_log_config: LogConfig::default(),
            restart_backoff: BackoffConfig::default(),
            runtime_timeout_secs: 30,
            default_stop_timeout_secs: crate::constants::DEFAULT_STOP_TIMEOUT_SECS,
            stats_interval_ms: 1000,
            copier_drain_timeout_ms: 2000,
        }
    }
}

impl DaemonConfig {
    /// Creates a default configuration rooted at `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Loads the configuration from a JSON file.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if it
    /// contains inconsistent values.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no daemon config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(HarbordError::io(path, e)),
        };
        let config: Self = serde_json::from_slice(&content).map_err(|e| HarbordError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for inconsistent values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.restart_backoff.validate()?;
        if self.runtime_timeout_secs == 0 {
            return Err(HarbordError::invalid("runtime-timeout-secs must be positive"));
        }
        if self.stats_interval_ms == 0 {
            return Err(HarbordError::invalid("stats-interval-ms must be positive"));
        }
        Ok(())
    }

    /// Directory holding one subdirectory per container.
    #[must_use]
    pub fn containers_root(&self) -> PathBuf {
        self.data_dir.join(crate::constants::CONTAINERS_DIR)
    }

    /// Deadline for runtime calls.
    #[must_use]
    pub const fn runtime_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_timeout_secs)
    }

    /// Interval between streamed stats samples.
    #[must_use]
    pub const fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Drain deadline for log copiers.
    #[must_use]
    pub const fn copier_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.copier_drain_timeout_ms)
    }
}

/// Exponential backoff curve for restart attempts.
///
/// The delay starts at `base_delay_ms`, doubles on each consecutive restart
/// and is capped at `max_delay_ms`. A run lasting at least
/// `reset_after_secs` resets the curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BackoffConfig {
    /// First restart delay.
    pub base_delay_ms: u64,
    /// Upper bound for the delay.
    pub max_delay_ms: u64,
    /// Run duration after which the delay resets to the base.
    pub reset_after_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 60_000,
            reset_after_secs: 10,
        }
    }
}

impl BackoffConfig {
    /// Checks the curve for consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the base is zero or exceeds the cap.
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(HarbordError::invalid("restart backoff base delay must be positive"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(HarbordError::invalid(format!(
                "restart backoff base delay {}ms exceeds maximum {}ms",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// First restart delay.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Upper bound for the delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Run duration after which the delay resets.
    #[must_use]
    pub const fn reset_after(&self) -> Duration {
        Duration::from_secs(self.reset_after_secs)
    }
}
