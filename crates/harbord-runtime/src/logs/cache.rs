//! Local read-back cache for drivers that cannot be read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use harbord_common::constants::CACHED_LOG_FILE;
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::LogConfig;
use serde::{Deserialize, Serialize};

use super::file::FileLogger;
use super::{LogMessage, LogReader, Logger};

/// Log option turning the local cache off.
pub const CACHE_DISABLED_OPTION: &str = "cache-disabled";

/// Persisted bookkeeping about the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalLogCacheMeta {
    /// Set once the user has been told the cache is in use.
    pub have_notify_enabled: bool,
}

/// Returns whether the cache should wrap a non-readable driver.
///
/// # Errors
///
/// Returns `InvalidParameter` if `cache-disabled` is not a boolean.
pub fn cache_enabled(config: &LogConfig) -> Result<bool> {
    match config.option(CACHE_DISABLED_OPTION) {
        None | Some("") => Ok(true),
        Some(value) => value.parse::<bool>().map(|disabled| !disabled).map_err(|_| {
            HarbordError::invalid(format!(
                "invalid value for log option {CACHE_DISABLED_OPTION}: {value}"
            ))
        }),
    }
}

/// Path of the cache file inside a container root.
#[must_use]
pub fn cache_path(container_root: &Path) -> PathBuf {
    container_root.join(CACHED_LOG_FILE)
}

/// Tees every message into the primary driver and a local cache file.
///
/// Cache write failures are logged and never fail the primary delivery.
pub struct CachingLogger {
    primary: Arc<dyn Logger>,
    cache: FileLogger,
}

impl std::fmt::Debug for CachingLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingLogger")
            .field("primary", &self.primary.name())
            .field("cache", &self.cache.path())
            .finish()
    }
}

impl CachingLogger {
    /// Wraps `primary`, mirroring into `cache_file`.
    #[must_use]
    pub fn new(primary: Arc<dyn Logger>, cache_file: PathBuf) -> Self {
        Self {
            primary,
            cache: FileLogger::cache(cache_file),
        }
    }
}

#[async_trait]
impl Logger for CachingLogger {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn log(&self, message: LogMessage) -> Result<()> {
        if let Err(e) = self.cache.log(message.clone()).await {
            tracing::warn!(
                path = %self.cache.path().display(),
                error = %e,
                "failed to write to local log cache"
            );
        }
        self.primary.log(message).await
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.cache.close().await {
            tracing::warn!(error = %e, "failed to close local log cache");
        }
        self.primary.close().await
    }

    fn reader(&self) -> Option<&dyn LogReader> {
        Some(&self.cache)
    }

    fn log_path(&self) -> Option<&Path> {
        self.primary.log_path()
    }

    fn dropped_messages(&self) -> u64 {
        self.primary.dropped_messages()
    }
}
