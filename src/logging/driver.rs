//! The binary log driver
//!
//! For detached containers the runtime spawns
//! `runectl _RUNECTL_INTERNAL_LOGGING <data-root>` with the container's
//! stdout on fd 3, stderr on fd 4 and a readiness pipe on fd 5. Lines are
//! forwarded to the driver recorded in `log-config.json`.

use super::journald::JournalWriter;
use super::json_file::{JsonFileWriter, LogEntry};
use super::{LogConfig, LogDriver};
use crate::error::Result;
use crate::store::DataStore;
use anyhow::Context;
use async_trait::async_trait;
use std::os::fd::FromRawFd;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const STDOUT_FD: i32 = 3;
const STDERR_FD: i32 = 4;
const READY_FD: i32 = 5;

/// Destination of forwarded lines
#[async_trait]
pub trait LogSink: Send {
    async fn forward(&mut self, entry: LogEntry) -> Result<()>;
}

#[async_trait]
impl LogSink for JsonFileWriter {
    async fn forward(&mut self, entry: LogEntry) -> Result<()> {
        self.write(&entry)
    }
}

#[async_trait]
impl LogSink for JournalWriter {
    async fn forward(&mut self, entry: LogEntry) -> Result<()> {
        self.write(&entry.stream, &entry.log).await
    }
}

struct Discard;

#[async_trait]
impl LogSink for Discard {
    async fn forward(&mut self, _entry: LogEntry) -> Result<()> {
        Ok(())
    }
}

fn spawn_reader<R>(reader: R, stream: &'static str, tx: mpsc::Sender<LogEntry>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(LogEntry::new(stream, line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("reading {}: {}", stream, e);
                    break;
                }
            }
        }
    });
}

/// Copy both streams into `sink` until they reach EOF
///
/// Each stream keeps its own order; the two are interleaved as lines arrive.
pub async fn pump<O, E>(stdout: O, stderr: E, sink: &mut dyn LogSink) -> Result<()>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(256);
    spawn_reader(stdout, "stdout", tx.clone());
    spawn_reader(stderr, "stderr", tx);
    while let Some(entry) = rx.recv().await {
        sink.forward(entry).await?;
    }
    Ok(())
}

/// Entry point of the logger process
pub async fn run(data_root: &Path) -> anyhow::Result<()> {
    let id = std::env::var("CONTAINER_ID").context("CONTAINER_ID is not set")?;
    let namespace = std::env::var("CONTAINER_NAMESPACE").context("CONTAINER_NAMESPACE is not set")?;
    let store = DataStore::new(data_root, &namespace);
    let dir = store.container(&id);
    let config = LogConfig::load(&dir)
        .with_context(|| format!("failed to load log config of {}", id))?;
    debug!("logging {} through {}", id, config.driver);

    let mut sink: Box<dyn LogSink> = match config.driver {
        LogDriver::JsonFile => Box::new(
            JsonFileWriter::from_config(dir.log_path(), &config)
                .with_context(|| format!("failed to open {}", dir.log_path().display()))?,
        ),
        LogDriver::Journald => {
            Box::new(JournalWriter::connect(&config, &id).context("failed to reach the journal")?)
        }
        LogDriver::None => Box::new(Discard),
    };

    // SAFETY: the runtime hands these descriptors to us and nothing else in
    // this process owns them.
    let (stdout, stderr) = unsafe {
        (
            std::fs::File::from_raw_fd(STDOUT_FD),
            std::fs::File::from_raw_fd(STDERR_FD),
        )
    };
    nix::unistd::close(READY_FD).context("failed to signal readiness")?;

    pump(
        tokio::fs::File::from_std(stdout),
        tokio::fs::File::from_std(stderr),
        sink.as_mut(),
    )
    .await
    .context("failed to forward container output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::json_file::read_all;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_pump_into_json_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("c-json.log");
        let mut writer = JsonFileWriter::open(&path, 0, 1, false).unwrap();

        let stdout = Cursor::new(b"hello\nworld\npartial".to_vec());
        let stderr = Cursor::new(b"oops\n".to_vec());
        pump(stdout, stderr, &mut writer).await.unwrap();

        let entries = read_all(&path).unwrap();
        let out: Vec<&str> = entries
            .iter()
            .filter(|e| e.stream == "stdout")
            .map(|e| e.log.as_str())
            .collect();
        assert_eq!(out, vec!["hello\n", "world\n", "partial"]);
        let err: Vec<&str> = entries
            .iter()
            .filter(|e| e.stream == "stderr")
            .map(|e| e.log.as_str())
            .collect();
        assert_eq!(err, vec!["oops\n"]);
    }
}
