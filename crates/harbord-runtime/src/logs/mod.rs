//! Container log pipeline.
//!
//! Output flows from the task's stdio through the [`copier`] into a
//! [`Logger`] chosen by driver name. Drivers that cannot be read back are
//! mirrored into a local [`cache`]; non-blocking mode puts a bounded
//! [`ring`] buffer in front of the driver.

pub mod cache;
pub mod copier;
pub mod file;
pub mod ring;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harbord_common::constants::{
    DEFAULT_MAX_BUFFER_SIZE, LOCAL_LOG_FILE, LOCAL_LOGS_DIR,
};
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::{ContainerId, ImageId, LogConfig};
use tokio::sync::mpsc;

use crate::stream::StreamKind;

/// Driver name that disables logging.
pub const NONE_DRIVER: &str = "none";
/// Built-in driver writing JSON lines next to the container document.
pub const JSON_FILE_DRIVER: &str = "json-file";
/// Built-in driver writing into the container's private log directory.
pub const LOCAL_DRIVER: &str = "local";

/// Log option selecting blocking or non-blocking delivery.
pub const MODE_OPTION: &str = "mode";
/// Log option bounding the non-blocking ring buffer.
pub const MAX_BUFFER_SIZE_OPTION: &str = "max-buffer-size";

/// One framed line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    /// Payload without the trailing newline.
    pub line: Vec<u8>,
    /// Stream the line was written to.
    pub source: StreamKind,
    /// Time the copier received the line.
    pub timestamp: DateTime<Utc>,
    /// `true` if the line was split or unterminated.
    pub partial: bool,
}

impl LogMessage {
    /// Builds a complete line stamped with the current time.
    #[must_use]
    pub fn new(source: StreamKind, line: impl Into<Vec<u8>>) -> Self {
        Self {
            line: line.into(),
            source,
            timestamp: Utc::now(),
            partial: false,
        }
    }
}

/// Filters applied when reading logs back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadConfig {
    /// Only the last `tail` lines; `None` for all.
    pub tail: Option<usize>,
    /// Skip lines logged before this time.
    pub since: Option<DateTime<Utc>>,
    /// Stop at lines logged after this time.
    pub until: Option<DateTime<Utc>>,
    /// Keep streaming new lines until the logger closes.
    pub follow: bool,
}

impl ReadConfig {
    /// Returns `true` if a line at `timestamp` is older than `since`.
    #[must_use]
    pub fn is_before_since(&self, timestamp: DateTime<Utc>) -> bool {
        self.since.is_some_and(|since| timestamp < since)
    }

    /// Returns `true` if a line at `timestamp` is newer than `until`.
    #[must_use]
    pub fn is_after_until(&self, timestamp: DateTime<Utc>) -> bool {
        self.until.is_some_and(|until| timestamp > until)
    }
}

/// Stream of log lines produced by a read. Errors end the stream.
pub type LogStream = mpsc::Receiver<Result<LogMessage>>;

/// A driver whose output can be queried.
pub trait LogReader: Send + Sync {
    /// Starts reading. The returned channel closes when the read is done.
    fn read_logs(&self, config: &ReadConfig) -> LogStream;
}

/// A log driver instance bound to one container run.
#[async_trait]
pub trait Logger: Send + Sync {
    /// Driver name.
    fn name(&self) -> &str;

    /// Delivers one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver failed to accept the message.
    async fn log(&self, message: LogMessage) -> Result<()>;

    /// Flushes and releases the driver.
    ///
    /// # Errors
    ///
    /// Returns an error if buffered data could not be flushed.
    async fn close(&self) -> Result<()>;

    /// Read side of the driver, if it supports reading.
    fn reader(&self) -> Option<&dyn LogReader> {
        None
    }

    /// File the driver writes to, if it exposes one.
    fn log_path(&self) -> Option<&Path> {
        None
    }

    /// Messages discarded instead of delivered.
    fn dropped_messages(&self) -> u64 {
        0
    }
}

/// Container metadata handed to a driver factory.
#[derive(Debug, Clone)]
pub struct LoggerInfo {
    /// Driver options.
    pub config: BTreeMap<String, String>,
    /// Container ID.
    pub container_id: ContainerId,
    /// Container name.
    pub container_name: String,
    /// Image reference the container was created from.
    pub container_image_name: String,
    /// Resolved image ID.
    pub container_image_id: ImageId,
    /// Creation time.
    pub container_created: DateTime<Utc>,
    /// Container environment.
    pub container_env: Vec<String>,
    /// Container labels.
    pub container_labels: BTreeMap<String, String>,
    /// Container root directory.
    pub container_root: PathBuf,
}

impl LoggerInfo {
    /// Path of the `json-file` driver's log.
    #[must_use]
    pub fn json_log_path(&self) -> PathBuf {
        self.container_root
            .join(format!("{}-json.log", self.container_id))
    }

    /// Path of the `local` driver's log.
    #[must_use]
    pub fn local_log_path(&self) -> PathBuf {
        self.container_root.join(LOCAL_LOGS_DIR).join(LOCAL_LOG_FILE)
    }
}

/// Builds a driver for one container run.
pub type LoggerFactory = Arc<dyn Fn(&LoggerInfo) -> Result<Arc<dyn Logger>> + Send + Sync>;

/// Registry of log drivers by name.
pub struct LogDriverRegistry {
    drivers: RwLock<BTreeMap<String, LoggerFactory>>,
}

impl std::fmt::Debug for LogDriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

impl Default for LogDriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LogDriverRegistry {
    /// Creates a registry holding the built-in `json-file` and `local` drivers.
    #[must_use]
    pub fn new() -> Self {
        let mut drivers: BTreeMap<String, LoggerFactory> = BTreeMap::new();
        let _ = drivers.insert(
            JSON_FILE_DRIVER.into(),
            Arc::new(|info: &LoggerInfo| -> Result<Arc<dyn Logger>> {
                Ok(Arc::new(file::FileLogger::json_file(info.json_log_path())))
            }),
        );
        let _ = drivers.insert(
            LOCAL_DRIVER.into(),
            Arc::new(|info: &LoggerInfo| -> Result<Arc<dyn Logger>> {
                Ok(Arc::new(file::FileLogger::local(info.local_log_path())?))
            }),
        );
        Self {
            drivers: RwLock::new(drivers),
        }
    }

    /// Registers an additional driver.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for the reserved `none` name and `Conflict`
    /// if a driver of that name exists.
    pub fn register(&self, name: impl Into<String>, factory: LoggerFactory) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name == NONE_DRIVER {
            return Err(HarbordError::invalid(format!(
                "log driver name '{name}' is reserved"
            )));
        }
        let mut drivers = self
            .drivers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if drivers.contains_key(&name) {
            return Err(HarbordError::conflict(format!(
                "log driver '{name}' is already registered"
            )));
        }
        let _ = drivers.insert(name, factory);
        Ok(())
    }

    /// Names of the registered drivers.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.drivers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Looks up the factory of a driver.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if no driver of that name is registered.
    pub fn factory(&self, name: &str) -> Result<LoggerFactory> {
        self.drivers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| {
                HarbordError::invalid(format!("logger: no log driver named '{name}' is registered"))
            })
    }

    /// Checks a log configuration without building a driver.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for unknown drivers or malformed options.
    pub fn validate(&self, config: &LogConfig) -> Result<()> {
        if config.driver != NONE_DRIVER {
            let _ = self.factory(&config.driver)?;
        }
        let _ = delivery_mode(config)?;
        let _ = cache::cache_enabled(config)?;
        Ok(())
    }
}

/// How messages reach the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The copier waits for the driver.
    Blocking,
    /// A bounded ring buffer decouples the copier from the driver.
    NonBlocking {
        /// Ring capacity in payload bytes.
        max_buffer_size: usize,
    },
}

/// Reads the delivery mode from the log options.
///
/// # Errors
///
/// Returns `InvalidParameter` for an unknown mode, a malformed size, or a
/// buffer size given without non-blocking mode.
pub fn delivery_mode(config: &LogConfig) -> Result<DeliveryMode> {
    let size = config.option(MAX_BUFFER_SIZE_OPTION);
    match config.option(MODE_OPTION).unwrap_or("") {
        "" | "blocking" => {
            if size.is_some() {
                return Err(HarbordError::invalid(
                    "logger: max-buffer-size option is only supported with 'mode=non-blocking'",
                ));
            }
            Ok(DeliveryMode::Blocking)
        }
        "non-blocking" => {
            let max_buffer_size = match size {
                Some(value) => parse_size(value)?,
                None => DEFAULT_MAX_BUFFER_SIZE,
            };
            Ok(DeliveryMode::NonBlocking { max_buffer_size })
        }
        other => Err(HarbordError::invalid(format!(
            "logger: logging mode not supported: {other}"
        ))),
    }
}

/// Parses a human size such as `512k`, `1m`, `4MiB` or `2048` into bytes.
///
/// Suffixes are binary multiples.
///
/// # Errors
///
/// Returns `InvalidParameter` if the value is malformed or zero.
pub fn parse_size(value: &str) -> Result<usize> {
    let invalid = || HarbordError::invalid(format!("invalid size: '{value}'"));
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    let number: f64 = number.parse().map_err(|_| invalid())?;
    let multiplier: f64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" | "kib" => 1024.0,
        "m" | "mb" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return Err(invalid()),
    };
    let bytes = (number * multiplier).floor();
    if !bytes.is_finite() || bytes < 1.0 || bytes > f64::from(u32::MAX) * 1024.0 {
        return Err(invalid());
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(bytes as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size("2048").unwrap(), 2048);
        assert_eq!(parse_size("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1m").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("4MiB").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_size("1.5k").unwrap(), 1536);
        for bad in ["", "k", "12q", "0", "-1m"] {
            assert!(parse_size(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn delivery_mode_defaults_to_blocking() {
        let config = LogConfig::default();
        assert_eq!(delivery_mode(&config).unwrap(), DeliveryMode::Blocking);
    }

    #[test]
    fn non_blocking_mode_reads_buffer_size() {
        let config = LogConfig::default()
            .with_option(MODE_OPTION, "non-blocking")
            .with_option(MAX_BUFFER_SIZE_OPTION, "4k");
        assert_eq!(
            delivery_mode(&config).unwrap(),
            DeliveryMode::NonBlocking {
                max_buffer_size: 4096
            }
        );
        let default_size = LogConfig::default().with_option(MODE_OPTION, "non-blocking");
        assert_eq!(
            delivery_mode(&default_size).unwrap(),
            DeliveryMode::NonBlocking {
                max_buffer_size: DEFAULT_MAX_BUFFER_SIZE
            }
        );
    }

    #[test]
    fn buffer_size_requires_non_blocking() {
        let config = LogConfig::default().with_option(MAX_BUFFER_SIZE_OPTION, "4k");
        assert!(delivery_mode(&config).is_err());
        let config = LogConfig::default().with_option(MODE_OPTION, "sometimes");
        assert!(delivery_mode(&config).is_err());
    }

    #[test]
    fn registry_knows_builtins_and_rejects_unknown() {
        let registry = LogDriverRegistry::new();
        assert_eq!(registry.names(), vec!["json-file".to_string(), "local".to_string()]);
        registry.validate(&LogConfig::driver("none")).unwrap();
        let err = registry.validate(&LogConfig::driver("syslog")).unwrap_err();
        assert_eq!(err.kind(), harbord_common::error::ErrorKind::InvalidParameter);
    }

    #[test]
    fn registry_rejects_reserved_and_duplicate_names() {
        let registry = LogDriverRegistry::new();
        let factory: LoggerFactory = Arc::new(|info: &LoggerInfo| -> Result<Arc<dyn Logger>> {
            Ok(Arc::new(file::FileLogger::json_file(info.json_log_path())))
        });
        assert!(registry.register("none", Arc::clone(&factory)).is_err());
        assert!(registry.register("json-file", Arc::clone(&factory)).is_err());
        registry.register("custom", factory).unwrap();
        assert!(registry.factory("custom").is_ok());
    }

    #[test]
    fn read_config_time_filters() {
        let now = Utc::now();
        let config = ReadConfig {
            since: Some(now),
            until: Some(now + chrono::TimeDelta::seconds(1)),
            ..ReadConfig::default()
        };
        assert!(config.is_before_since(now - chrono::TimeDelta::seconds(1)));
        assert!(!config.is_before_since(now));
        assert!(config.is_after_until(now + chrono::TimeDelta::seconds(2)));
    }
}
