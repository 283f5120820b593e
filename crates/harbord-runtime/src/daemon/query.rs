//! Logs, stats and attach.

use std::sync::Arc;

use chrono::Utc;
use harbord_common::error::{HarbordError, Result};
use tokio::sync::mpsc;

use super::Daemon;
use crate::backend::with_deadline;
use crate::logs::{LogStream, Logger, NONE_DRIVER, ReadConfig};
use crate::stats::{ContainerStats, StatsOptions};
use crate::stream::{StreamKind, StreamReader};

const STATS_CHANNEL_CAPACITY: usize = 16;

impl Daemon {
    /// Reads a container's logs.
    ///
    /// `follow` is ignored for containers that are not running.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the configured driver cannot be read
    /// and no local cache is available.
    pub async fn logs(&self, reference: &str, mut config: ReadConfig) -> Result<LogStream> {
        let container = self.container(reference)?;
        let mut inner = container.lock().await;
        if inner.host_config.log_config.driver == NONE_DRIVER {
            return Err(HarbordError::invalid(format!(
                "configured logging driver does not support reading for container {}",
                container.id()
            )));
        }
        if !inner.state().is_active() {
            config.follow = false;
        }
        let logger: Arc<dyn Logger> = match inner.log_driver() {
            Some(logger) => Arc::clone(logger),
            None => inner.start_logger(&self.log_drivers)?,
        };
        let reader = logger.reader().ok_or_else(|| {
            HarbordError::invalid(format!(
                "configured logging driver \"{}\" does not support reading",
                logger.name()
            ))
        })?;
        tracing::debug!(id = %container.id(), driver = logger.name(), follow = config.follow, "reading logs");
        Ok(reader.read_logs(&config))
    }

    /// Messages the container's active log pipeline has dropped.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Ambiguous` if the reference does not resolve.
    pub async fn logger_dropped_messages(&self, reference: &str) -> Result<u64> {
        let container = self.container(reference)?;
        let inner = container.lock().await;
        Ok(inner.log_driver().map_or(0, |logger| logger.dropped_messages()))
    }

    /// Samples resource usage.
    ///
    /// The returned channel yields a single frame unless `stream` is set, in
    /// which case frames follow every stats interval until the receiver is
    /// dropped or the task goes away. A container without a live task yields
    /// one frame carrying only its name and ID.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for contradictory options.
    pub async fn stats(
        &self,
        reference: &str,
        options: StatsOptions,
    ) -> Result<mpsc::Receiver<ContainerStats>> {
        options.validate()?;
        let container = self.container(reference)?;
        let (task, name) = {
            let inner = container.lock().await;
            let task = inner.task().filter(|_| inner.state().is_running());
            (task, inner.name().to_string())
        };
        let id = container.id().clone();
        let (tx, rx) = mpsc::channel(STATS_CHANNEL_CAPACITY);

        let Some(task) = task else {
            let _ = tx.try_send(ContainerStats::empty(&id, &name));
            return Ok(rx);
        };

        let interval = self.config.stats_interval();
        let timeout = self.config.runtime_timeout();
        drop(tokio::spawn(async move {
            let mut previous: Option<ContainerStats> = None;
            loop {
                let usage = match with_deadline(timeout, "stats", task.stats()).await {
                    Ok(usage) => usage,
                    Err(e) => {
                        tracing::debug!(id = %id, error = %e, "stats sampling stopped");
                        break;
                    }
                };
                let frame =
                    ContainerStats::from_sample(&id, &name, &usage, Utc::now(), previous.as_ref());
                let primed = previous.is_some();
                if options.stream || options.one_shot || primed {
                    if tx.send(frame.clone()).await.is_err() || !options.stream {
                        break;
                    }
                }
                previous = Some(frame);
                tokio::time::sleep(interval).await;
            }
        }));
        Ok(rx)
    }

    /// Opens a lossy reader on one of the container's output streams.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Ambiguous` if the reference does not resolve.
    pub fn attach(&self, reference: &str, kind: StreamKind) -> Result<StreamReader> {
        let container = self.container(reference)?;
        Ok(container.streams().attach(kind))
    }

    /// Returns a sender feeding the container's stdin.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the task has no open stdin.
    pub fn stdin(&self, reference: &str) -> Result<mpsc::Sender<Vec<u8>>> {
        let container = self.container(reference)?;
        container.streams().stdin().ok_or_else(|| {
            HarbordError::conflict(format!("container {} has no open stdin", container.id()))
        })
    }
}
