//! `harbord logs` — Print container logs.

use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use clap::Args;
use harbord_common::config::DaemonConfig;
use harbord_runtime::container::Container;
use harbord_runtime::logs::cache::cache_path;
use harbord_runtime::logs::file::FileLogger;
use harbord_runtime::logs::{LogDriverRegistry, Logger, NONE_DRIVER, ReadConfig};

use super::DataDir;

/// Arguments for the logs command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container ID, unique ID prefix or name.
    pub container: String,

    /// Number of lines to show from the end of the logs.
    #[arg(long)]
    pub tail: Option<usize>,

    /// Only lines logged at or after this time (RFC 3339).
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,

    /// Only lines logged at or before this time (RFC 3339).
    #[arg(long)]
    pub until: Option<DateTime<Utc>>,

    /// Prefix each line with its timestamp.
    #[arg(short, long)]
    pub timestamps: bool,
}

/// Executes the logs command.
///
/// # Errors
///
/// Returns an error if the container cannot be found or its logs cannot be
/// read.
pub async fn execute(args: &LogsArgs, config: &DaemonConfig) -> anyhow::Result<()> {
    let data = DataDir::load(config)?;
    let container = data.store.resolve(&args.container)?;
    let logger = open_logger(&container).await?;
    let reader = logger
        .reader()
        .ok_or_else(|| anyhow!("log driver {} does not support reading", logger.name()))?;

    let mut stream = reader.read_logs(&ReadConfig {
        tail: args.tail,
        since: args.since,
        until: args.until,
        follow: false,
    });
    while let Some(message) = stream.recv().await {
        let message = message?;
        let line = String::from_utf8_lossy(&message.line);
        if args.timestamps {
            println!("{} {line}", message.timestamp.to_rfc3339());
        } else {
            println!("{line}");
        }
    }

    if let Err(e) = logger.close().await {
        tracing::warn!(id = %container.id(), error = %e, "failed to close log reader");
    }
    Ok(())
}

/// Opens the configured driver, or the local cache for drivers this binary
/// does not know.
async fn open_logger(container: &Container) -> anyhow::Result<Arc<dyn Logger>> {
    let mut inner = container.lock().await;
    let driver = inner.host_config.log_config.driver.clone();
    anyhow::ensure!(
        driver != NONE_DRIVER,
        "container {} has logging disabled",
        container.id()
    );
    match inner.start_logger(&LogDriverRegistry::new()) {
        Ok(logger) => Ok(logger),
        Err(e) => {
            let cache = cache_path(container.root());
            if !cache.is_file() {
                return Err(e.into());
            }
            tracing::debug!(id = %container.id(), %driver, "reading logs from the local cache");
            Ok(Arc::new(FileLogger::cache(cache)))
        }
    }
}
