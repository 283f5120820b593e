//! File-backed log drivers.
//!
//! Both `json-file` and `local` store one JSON object per line:
//!
//! ```text
//! {"log":"hello\n","stream":"stdout","time":"2026-01-02T03:04:05.000000006Z"}
//! ```
//!
//! A complete line keeps its trailing newline inside `log`; a partial line
//! has none. The same format backs the local read-back cache.

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harbord_common::constants::CONTAINER_DIR_MODE;
use harbord_common::error::{HarbordError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, watch};

use super::{
    JSON_FILE_DRIVER, LOCAL_DRIVER, LogMessage, LogReader, LogStream, Logger, ReadConfig,
};
use crate::stream::StreamKind;

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    log: String,
    stream: StreamKind,
    time: DateTime<Utc>,
}

fn encode(message: &LogMessage) -> Result<Vec<u8>> {
    let mut log = String::from_utf8_lossy(&message.line).into_owned();
    if !message.partial {
        log.push('\n');
    }
    let entry = Entry {
        log,
        stream: message.source,
        time: message.timestamp,
    };
    let mut bytes = serde_json::to_vec(&entry)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn decode(line: &[u8]) -> Option<LogMessage> {
    let entry: Entry = match serde_json::from_slice(line) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed log entry");
            return None;
        }
    };
    let mut log = entry.log.into_bytes();
    let partial = log.last() != Some(&b'\n');
    if !partial {
        let _ = log.pop();
    }
    Some(LogMessage {
        line: log,
        source: entry.stream,
        timestamp: entry.time,
        partial,
    })
}

/// Logger appending JSON lines to a file.
#[derive(Debug)]
pub struct FileLogger {
    driver: &'static str,
    path: PathBuf,
    expose_path: bool,
    file: Mutex<Option<tokio::fs::File>>,
    closed: watch::Sender<bool>,
}

impl FileLogger {
    fn new(driver: &'static str, path: PathBuf, expose_path: bool) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            driver,
            path,
            expose_path,
            file: Mutex::new(None),
            closed,
        }
    }

    /// The `json-file` driver. Its path is recorded in the container document.
    #[must_use]
    pub fn json_file(path: PathBuf) -> Self {
        Self::new(JSON_FILE_DRIVER, path, true)
    }

    /// The `local` driver. Creates the private log directory (mode 0700).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn local(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(CONTAINER_DIR_MODE)
                .create(dir)
                .map_err(|e| HarbordError::io(dir, e))?;
        }
        Ok(Self::new(LOCAL_DRIVER, path, false))
    }

    /// A read-back cache file for drivers that cannot be read.
    #[must_use]
    pub fn cache(path: PathBuf) -> Self {
        Self::new("cache", path, false)
    }

    /// File this logger appends to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Logger for FileLogger {
    fn name(&self) -> &str {
        self.driver
    }

    async fn log(&self, message: LogMessage) -> Result<()> {
        if *self.closed.borrow() {
            return Err(HarbordError::system(format!(
                "{} logger for {} is closed",
                self.driver,
                self.path.display()
            )));
        }
        let bytes = encode(&message)?;
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| HarbordError::io(&self.path, e))?;
            *guard = Some(file);
        }
        let Some(file) = guard.as_mut() else {
            return Err(HarbordError::system("log file handle missing"));
        };
        file.write_all(&bytes)
            .await
            .map_err(|e| HarbordError::io(&self.path, e))
    }

    async fn close(&self) -> Result<()> {
        let file = self.file.lock().await.take();
        let _ = self.closed.send_replace(true);
        if let Some(mut file) = file {
            file.flush()
                .await
                .map_err(|e| HarbordError::io(&self.path, e))?;
        }
        Ok(())
    }

    fn reader(&self) -> Option<&dyn LogReader> {
        Some(self)
    }

    fn log_path(&self) -> Option<&Path> {
        self.expose_path.then_some(self.path.as_path())
    }
}

impl LogReader for FileLogger {
    fn read_logs(&self, config: &ReadConfig) -> LogStream {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let path = self.path.clone();
        let config = config.clone();
        let closed = self.closed.subscribe();
        drop(tokio::spawn(async move {
            if let Err(e) = tail_file(&path, &config, closed, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        }));
        rx
    }
}

/// Splits complete lines off the front of `pending`, leaving any unterminated
/// remainder in place.
fn take_complete_lines(pending: &mut Vec<u8>) -> Vec<LogMessage> {
    let Some(last_newline) = pending.iter().rposition(|b| *b == b'\n') else {
        return Vec::new();
    };
    let rest = pending.split_off(last_newline + 1);
    let complete = std::mem::replace(pending, rest);
    complete
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .filter_map(decode)
        .collect()
}

/// Sends matching messages; returns `false` once the read should end.
async fn send_matching(
    messages: Vec<LogMessage>,
    config: &ReadConfig,
    tx: &mpsc::Sender<Result<LogMessage>>,
) -> bool {
    for message in messages {
        if config.is_before_since(message.timestamp) {
            continue;
        }
        if config.is_after_until(message.timestamp) {
            return false;
        }
        if tx.send(Ok(message)).await.is_err() {
            return false;
        }
    }
    true
}

async fn tail_file(
    path: &Path,
    config: &ReadConfig,
    mut closed: watch::Receiver<bool>,
    tx: &mpsc::Sender<Result<LogMessage>>,
) -> Result<()> {
    let mut pending = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(HarbordError::io(path, e)),
    };
    let mut offset = pending.len() as u64;
    let mut messages = take_complete_lines(&mut pending);
    if let Some(tail) = config.tail {
        let skip = messages.len().saturating_sub(tail);
        let _ = messages.drain(..skip);
    }
    if !send_matching(messages, config, tx).await || !config.follow {
        return Ok(());
    }

    let mut logger_gone = false;
    loop {
        let finished = *closed.borrow_and_update() || logger_gone;
        match tokio::fs::File::open(path).await {
            Ok(mut file) => {
                let _ = file
                    .seek(std::io::SeekFrom::Start(offset))
                    .await
                    .map_err(|e| HarbordError::io(path, e))?;
                let read = file
                    .read_to_end(&mut pending)
                    .await
                    .map_err(|e| HarbordError::io(path, e))?;
                offset += read as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(HarbordError::io(path, e)),
        }
        let messages = take_complete_lines(&mut pending);
        if !send_matching(messages, config, tx).await || finished {
            return Ok(());
        }
        if config.until.is_some_and(|until| Utc::now() > until) {
            return Ok(());
        }
        tokio::select! {
            () = tokio::time::sleep(FOLLOW_POLL_INTERVAL) => {}
            changed = closed.changed() => logger_gone = changed.is_err(),
            () = tx.closed() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    async fn collect(mut rx: LogStream) -> Vec<LogMessage> {
        let mut out = Vec::new();
        while let Some(message) = rx.recv().await {
            out.push(message.unwrap());
        }
        out
    }

    fn message(line: &str, at: DateTime<Utc>) -> LogMessage {
        LogMessage {
            line: line.as_bytes().to_vec(),
            source: StreamKind::Stdout,
            timestamp: at,
            partial: false,
        }
    }

    #[test]
    fn entry_format_keeps_newline_for_complete_lines() {
        let at = Utc::now();
        let bytes = encode(&message("hello", at)).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains(r#""log":"hello\n""#), "{text}");
        assert!(text.contains(r#""stream":"stdout""#), "{text}");

        let back = decode(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(back, message("hello", at));
    }

    #[test]
    fn partial_lines_have_no_newline() {
        let mut partial = message("abc", Utc::now());
        partial.partial = true;
        let bytes = encode(&partial).unwrap();
        let back = decode(&bytes[..bytes.len() - 1]).unwrap();
        assert!(back.partial);
        assert_eq!(back.line, b"abc");
    }

    #[tokio::test]
    async fn reads_back_with_tail_and_since() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = FileLogger::json_file(dir.path().join("c-json.log"));
        let base = Utc::now();
        for i in 0..5 {
            logger
                .log(message(&format!("line {i}"), base + TimeDelta::seconds(i)))
                .await
                .unwrap();
        }
        logger.close().await.unwrap();

        let tail = collect(logger.read_logs(&ReadConfig {
            tail: Some(2),
            ..ReadConfig::default()
        }))
        .await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].line, b"line 3");

        let since = collect(logger.read_logs(&ReadConfig {
            since: Some(base + TimeDelta::seconds(3)),
            until: Some(base + TimeDelta::seconds(3)),
            ..ReadConfig::default()
        }))
        .await;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].line, b"line 3");
    }

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = FileLogger::json_file(dir.path().join("never-written.log"));
        assert!(collect(logger.read_logs(&ReadConfig::default())).await.is_empty());
    }

    #[tokio::test]
    async fn follow_streams_until_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = std::sync::Arc::new(FileLogger::json_file(dir.path().join("f.log")));
        logger.log(message("before", Utc::now())).await.unwrap();

        let mut rx = logger.read_logs(&ReadConfig {
            follow: true,
            ..ReadConfig::default()
        });
        assert_eq!(rx.recv().await.unwrap().unwrap().line, b"before");

        logger.log(message("after", Utc::now())).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().line, b"after");

        logger.close().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn local_driver_hides_its_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("local-logs").join("container.log");
        let local = FileLogger::local(path.clone()).unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert!(local.log_path().is_none());

        let json = FileLogger::json_file(dir.path().join("x-json.log"));
        assert_eq!(json.log_path(), Some(dir.path().join("x-json.log").as_path()));
    }

    #[tokio::test]
    async fn closed_logger_rejects_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = FileLogger::json_file(dir.path().join("c.log"));
        logger.close().await.unwrap();
        assert!(logger.log(message("late", Utc::now())).await.is_err());
    }
}
