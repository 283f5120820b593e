//! Per-container stdio plumbing.
//!
//! The task's stdout and stderr are pumped into broadcasters that fan each
//! chunk out to every subscriber. The log copier subscribes with a reliable
//! pipe that applies backpressure; attach sessions get lossy pipes so a slow
//! or vanished client can never stall the logger.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 64;
const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Output stream of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Boxed reader half of a task's output stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed writer half of a task's input stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stdio handles of a task as handed out by the runtime.
#[derive(Default)]
pub struct ProcessIo {
    /// Task stdin, if it was opened.
    pub stdin: Option<BoxedWriter>,
    /// Task stdout.
    pub stdout: Option<BoxedReader>,
    /// Task stderr.
    pub stderr: Option<BoxedReader>,
}

impl fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::Sender<Vec<u8>>,
    lossy: bool,
}

#[derive(Debug, Default)]
struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Broadcaster {
    fn subscribe(&self, lossy: bool) -> StreamReader {
        let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
        lock(&self.subscribers).push(Subscriber { tx, lossy });
        StreamReader { rx }
    }

    async fn write(&self, chunk: &[u8]) {
        let targets: Vec<(mpsc::Sender<Vec<u8>>, bool)> = lock(&self.subscribers)
            .iter()
            .map(|s| (s.tx.clone(), s.lossy))
            .collect();
        for (tx, lossy) in targets {
            if lossy {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(chunk.to_vec()) {
                    tracing::trace!("attach reader too slow, chunk skipped");
                }
            } else if tx.send(chunk.to_vec()).await.is_err() {
                tracing::trace!("pipe reader went away");
            }
        }
        lock(&self.subscribers).retain(|s| !s.tx.is_closed());
    }

    fn close(&self) {
        lock(&self.subscribers).clear();
    }
}

/// Receiving end of a stream pipe. Yields `None` once the stream closes.
#[derive(Debug)]
pub struct StreamReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl StreamReader {
    /// Receives the next chunk of output.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Broadcastable stdio of one container.
#[derive(Debug, Default)]
pub struct StreamConfig {
    stdout: Arc<Broadcaster>,
    stderr: Arc<Broadcaster>,
    stdin: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamConfig {
    /// Creates an idle stream set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn broadcaster(&self, kind: StreamKind) -> &Broadcaster {
        match kind {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    /// Opens a reliable pipe: writes wait for this reader to keep up.
    #[must_use]
    pub fn pipe(&self, kind: StreamKind) -> StreamReader {
        self.broadcaster(kind).subscribe(false)
    }

    /// Opens a lossy pipe for an attach session.
    ///
    /// Chunks are skipped while the reader is behind; dropping the reader
    /// detaches it without affecting other subscribers.
    #[must_use]
    pub fn attach(&self, kind: StreamKind) -> StreamReader {
        self.broadcaster(kind).subscribe(true)
    }

    /// Returns a sender feeding the task's stdin, if one is open.
    #[must_use]
    pub fn stdin(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        lock(&self.stdin).clone()
    }

    /// Closes the task's stdin.
    pub fn close_stdin(&self) {
        drop(lock(&self.stdin).take());
    }

    /// Starts pumping the task's stdio through the broadcasters.
    pub fn copy_to_pipe(&self, io: ProcessIo) {
        let mut pumps = lock(&self.pumps);
        pumps.retain(|handle| !handle.is_finished());
        if let Some(reader) = io.stdout {
            pumps.push(tokio::spawn(pump(reader, Arc::clone(&self.stdout))));
        }
        if let Some(reader) = io.stderr {
            pumps.push(tokio::spawn(pump(reader, Arc::clone(&self.stderr))));
        }
        if let Some(writer) = io.stdin {
            let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
            *lock(&self.stdin) = Some(tx);
            drop(tokio::spawn(feed_stdin(rx, writer)));
        }
    }

    /// Waits for the output pumps to reach end of stream, then closes every
    /// pipe, including those of streams the task never opened.
    ///
    /// Returns `false` if the deadline passed; the pumps are then aborted.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let pumps: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.pumps));
        let aborts: Vec<_> = pumps.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(timeout, async {
            for handle in pumps {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();
        if !joined {
            for abort in aborts {
                abort.abort();
            }
        }
        self.stdout.close();
        self.stderr.close();
        joined
    }
}

async fn pump(mut reader: BoxedReader, target: Arc<Broadcaster>) {
    let mut buf = vec![0_u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => target.write(&buf[..n]).await,
            Err(e) => {
                tracing::debug!(error = %e, "task output stream failed");
                break;
            }
        }
    }
    target.close();
}

async fn feed_stdin(mut rx: mpsc::Receiver<Vec<u8>>, mut writer: BoxedWriter) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            tracing::debug!(error = %e, "task stdin closed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn io_with_stdout() -> (tokio::io::DuplexStream, ProcessIo) {
        let (task_side, daemon_side) = tokio::io::duplex(1024);
        let io = ProcessIo {
            stdout: Some(Box::new(daemon_side)),
            ..ProcessIo::default()
        };
        (task_side, io)
    }

    #[tokio::test]
    async fn every_subscriber_sees_output() {
        let streams = StreamConfig::new();
        let mut logger = streams.pipe(StreamKind::Stdout);
        let mut attached = streams.attach(StreamKind::Stdout);
        let (mut task, io) = io_with_stdout();
        streams.copy_to_pipe(io);

        task.write_all(b"hello\n").await.unwrap();
        drop(task);

        assert_eq!(logger.recv().await.unwrap(), b"hello\n");
        assert_eq!(attached.recv().await.unwrap(), b"hello\n");
        assert!(streams.wait(Duration::from_secs(1)).await);
        assert!(logger.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_attach_does_not_affect_logger() {
        let streams = StreamConfig::new();
        let mut logger = streams.pipe(StreamKind::Stdout);
        let attached = streams.attach(StreamKind::Stdout);
        let (mut task, io) = io_with_stdout();
        streams.copy_to_pipe(io);

        drop(attached);
        task.write_all(b"one\n").await.unwrap();
        assert_eq!(logger.recv().await.unwrap(), b"one\n");
        task.write_all(b"two\n").await.unwrap();
        assert_eq!(logger.recv().await.unwrap(), b"two\n");
    }

    #[tokio::test]
    async fn stdin_is_forwarded_to_the_task() {
        let streams = StreamConfig::new();
        let (daemon_side, mut task_side) = tokio::io::duplex(64);
        streams.copy_to_pipe(ProcessIo {
            stdin: Some(Box::new(daemon_side)),
            ..ProcessIo::default()
        });

        let tx = streams.stdin().unwrap();
        tx.send(b"input".to_vec()).await.unwrap();
        drop(tx);
        streams.close_stdin();

        let mut received = Vec::new();
        let _ = task_side.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"input");
    }
}
