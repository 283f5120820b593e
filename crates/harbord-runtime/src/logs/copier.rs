//! Copies task output into a log driver, one task per stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use harbord_common::constants::MAX_LOG_MESSAGE_SIZE;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{LogMessage, Logger};
use crate::stream::{StreamKind, StreamReader};

/// Frames stream output into log messages.
pub struct Copier {
    sources: Vec<(StreamKind, StreamReader)>,
    logger: Arc<dyn Logger>,
    tasks: Vec<JoinHandle<()>>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Copier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Copier")
            .field("driver", &self.logger.name())
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Copier {
    /// Creates a copier reading from `sources` into `logger`.
    #[must_use]
    pub fn new(sources: Vec<(StreamKind, StreamReader)>, logger: Arc<dyn Logger>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            sources,
            logger,
            tasks: Vec::new(),
            closed,
        }
    }

    /// Spawns one copy task per stream.
    pub fn run(&mut self) {
        for (kind, reader) in self.sources.drain(..) {
            let logger = Arc::clone(&self.logger);
            let closed = self.closed.subscribe();
            self.tasks.push(tokio::spawn(copy_stream(kind, reader, logger, closed)));
        }
    }

    /// Waits for every stream to reach end of file.
    ///
    /// Returns `false` if `timeout` elapsed first; the copy tasks are then
    /// stopped.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let finished = tokio::time::timeout(timeout, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await
        .is_ok();
        if !finished {
            self.close();
            for abort in aborts {
                abort.abort();
            }
        }
        finished
    }

    /// Stops copying without waiting for end of file.
    pub fn close(&self) {
        let _ = self.closed.send_replace(true);
    }
}

async fn copy_stream(
    kind: StreamKind,
    mut reader: StreamReader,
    logger: Arc<dyn Logger>,
    mut closed: watch::Receiver<bool>,
) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let chunk = tokio::select! {
            chunk = reader.recv() => chunk,
            _ = closed.changed() => None,
        };
        let Some(chunk) = chunk else { break };
        buf.extend_from_slice(&chunk);

        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = buf.drain(..=pos).collect();
            let _ = line.pop();
            emit(&logger, kind, line, false).await;
        }
        while buf.len() >= MAX_LOG_MESSAGE_SIZE {
            let part: Vec<u8> = buf.drain(..MAX_LOG_MESSAGE_SIZE).collect();
            emit(&logger, kind, part, true).await;
        }
    }
    if !buf.is_empty() {
        emit(&logger, kind, buf, true).await;
    }
}

async fn emit(logger: &Arc<dyn Logger>, source: StreamKind, line: Vec<u8>, partial: bool) {
    let message = LogMessage {
        line,
        source,
        timestamp: Utc::now(),
        partial,
    };
    if let Err(e) = logger.log(message).await {
        tracing::warn!(driver = logger.name(), stream = %source, error = %e, "failed to log message");
    }
}
