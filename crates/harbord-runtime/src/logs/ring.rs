//! Non-blocking delivery through a bounded ring buffer.
//!
//! The copier pushes into the ring without waiting; a drain task feeds the
//! wrapped driver. When the buffered payload exceeds the configured size the
//! oldest undelivered messages are discarded and counted.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use harbord_common::error::{HarbordError, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{LogMessage, LogReader, Logger};

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
const DROP_WARN_EVERY: u64 = 1000;

#[derive(Debug, Default)]
struct Queue {
    messages: VecDeque<LogMessage>,
    size: usize,
    closed: bool,
}

#[derive(Debug)]
struct Ring {
    queue: Mutex<Queue>,
    max_size: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl Ring {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, message: LogMessage) -> Result<()> {
        let mut dropped = 0;
        {
            let mut queue = self.lock();
            if queue.closed {
                return Err(HarbordError::system("ring logger is closed"));
            }
            queue.size += message.line.len();
            queue.messages.push_back(message);
            while queue.size > self.max_size && queue.messages.len() > 1 {
                if let Some(old) = queue.messages.pop_front() {
                    queue.size -= old.line.len();
                    dropped += 1;
                }
            }
        }
        self.notify.notify_one();
        if dropped > 0 {
            let before = self.dropped.fetch_add(dropped, Ordering::Relaxed);
            if before == 0 || (before + dropped) / DROP_WARN_EVERY > before / DROP_WARN_EVERY {
                tracing::warn!(
                    dropped_total = before + dropped,
                    max_buffer_size = self.max_size,
                    "log buffer full, dropping oldest messages"
                );
            }
        }
        Ok(())
    }

    /// Next message for the driver; `None` once closed and empty.
    async fn pop(&self) -> Option<LogMessage> {
        loop {
            {
                let mut queue = self.lock();
                if let Some(message) = queue.messages.pop_front() {
                    queue.size -= message.line.len();
                    return Some(message);
                }
                if queue.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Logger wrapper that never blocks the caller.
pub struct RingLogger {
    inner: Arc<dyn Logger>,
    ring: Arc<Ring>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RingLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingLogger")
            .field("driver", &self.inner.name())
            .field("max_size", &self.ring.max_size)
            .finish_non_exhaustive()
    }
}

impl RingLogger {
    /// Wraps `inner` with a ring holding at most `max_size` payload bytes.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(inner: Arc<dyn Logger>, max_size: usize) -> Self {
        let ring = Arc::new(Ring {
            queue: Mutex::new(Queue::default()),
            max_size,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        let drain = tokio::spawn(drain(Arc::clone(&ring), Arc::clone(&inner)));
        Self {
            inner,
            ring,
            drain: Mutex::new(Some(drain)),
        }
    }

    /// Messages currently waiting for the driver.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.ring.lock().messages.len()
    }
}

impl Drop for RingLogger {
    fn drop(&mut self) {
        self.ring.lock().closed = true;
        self.ring.notify.notify_one();
    }
}

async fn drain(ring: Arc<Ring>, inner: Arc<dyn Logger>) {
    while let Some(message) = ring.pop().await {
        if let Err(e) = inner.log(message).await {
            tracing::warn!(driver = inner.name(), error = %e, "log driver rejected message");
        }
    }
}

#[async_trait]
impl Logger for RingLogger {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn log(&self, message: LogMessage) -> Result<()> {
        self.ring.push(message)
    }

    async fn close(&self) -> Result<()> {
        self.ring.lock().closed = true;
        self.ring.notify.notify_one();
        let handle = self
            .drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, handle).await.is_err() {
                abort.abort();
                let lost = {
                    let mut queue = self.ring.lock();
                    let lost = queue.messages.len() as u64;
                    queue.messages.clear();
                    queue.size = 0;
                    lost
                };
                let _ = self.ring.dropped.fetch_add(lost, Ordering::Relaxed);
                tracing::warn!(
                    driver = self.inner.name(),
                    lost,
                    "log driver did not drain in time, discarding buffered messages"
                );
            }
        }
        self.inner.close().await
    }

    fn reader(&self) -> Option<&dyn LogReader> {
        self.inner.reader()
    }

    fn log_path(&self) -> Option<&Path> {
        self.inner.log_path()
    }

    fn dropped_messages(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed) + self.inner.dropped_messages()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Semaphore;

    use super::*;
    use crate::stream::StreamKind;

    /// Driver that blocks until permits are released.
    struct Gate {
        permits: Semaphore,
        seen: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Logger for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        async fn log(&self, message: LogMessage) -> Result<()> {
            self.permits.acquire().await.unwrap().forget();
            self.seen.lock().unwrap().push(message.line);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn line(n: usize) -> LogMessage {
        LogMessage::new(StreamKind::Stdout, format!("{n:04}"))
    }

    #[tokio::test]
    async fn blocked_driver_drops_oldest_without_blocking() {
        let gate = Arc::new(Gate {
            permits: Semaphore::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let ring = RingLogger::new(Arc::clone(&gate) as Arc<dyn Logger>, 40);

        let writes = tokio::time::timeout(Duration::from_secs(1), async {
            for n in 0..100 {
                ring.log(line(n)).await.unwrap();
            }
        })
        .await;
        assert!(writes.is_ok(), "ring writes must not block");
        assert!(ring.dropped_messages() > 0);
        assert!(ring.buffered() <= 11);

        gate.permits.add_permits(1000);
        ring.close().await.unwrap();
        let seen = gate.seen.lock().unwrap().clone();
        assert_eq!(seen.last().unwrap(), b"0099");
        assert_eq!(seen.len() as u64 + ring.dropped_messages(), 100);
    }

    #[tokio::test]
    async fn delivers_everything_when_driver_keeps_up() {
        let gate = Arc::new(Gate {
            permits: Semaphore::new(1000),
            seen: Mutex::new(Vec::new()),
        });
        let ring = RingLogger::new(Arc::clone(&gate) as Arc<dyn Logger>, 1024 * 1024);
        for n in 0..10 {
            ring.log(line(n)).await.unwrap();
        }
        ring.close().await.unwrap();
        assert_eq!(gate.seen.lock().unwrap().len(), 10);
        assert_eq!(ring.dropped_messages(), 0);
        assert!(ring.log(line(11)).await.is_err());
    }
}
