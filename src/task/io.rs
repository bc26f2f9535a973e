//! Stdio wiring between the client and a task
//!
//! The client creates named pipes under the container's `io/<process>`
//! directory and opens its own ends before handing the paths to the runtime,
//! which opens the other ends at task creation. A reader that was open before
//! any writer sees EOF once the last writer goes away, and nothing the process
//! writes before the copies start is lost.

use super::tty::DetachScanner;
use crate::error::Result;
use crate::runtime::{FifoSet, Runtime, TaskIo};
use nix::sys::stat::Mode;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long output copies may lag behind the exit of the process
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// FIFOs for one process
#[derive(Debug)]
pub struct StdioFifos {
    dir: PathBuf,
    set: FifoSet,
}

fn mkfifo(path: &Path) -> Result<()> {
    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o600)) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(std::io::Error::from(e).into()),
    }
}

impl StdioFifos {
    /// Create the pipes; a terminal merges stderr into stdout
    pub fn create(dir: PathBuf, stdin: bool, terminal: bool) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let mut set = FifoSet {
            terminal,
            ..Default::default()
        };
        if stdin {
            let path = dir.join("stdin");
            mkfifo(&path)?;
            set.stdin = Some(path);
        }
        let stdout = dir.join("stdout");
        mkfifo(&stdout)?;
        set.stdout = Some(stdout);
        if !terminal {
            let stderr = dir.join("stderr");
            mkfifo(&stderr)?;
            set.stderr = Some(stderr);
        }
        Ok(Self { dir, set })
    }

    pub fn task_io(&self) -> TaskIo {
        TaskIo::Fifos(self.set.clone())
    }

    pub fn terminal(&self) -> bool {
        self.set.terminal
    }

    /// Open the client ends; call before the runtime creates the task
    pub fn open(&self) -> Result<ClientStreams> {
        let stdin = match &self.set.stdin {
            // No reader exists yet, so a write-only open would fail.
            Some(path) => Some(pipe::OpenOptions::new().read_write(true).open_sender(path)?),
            None => None,
        };
        let stdout = match &self.set.stdout {
            Some(path) => Some(pipe::OpenOptions::new().open_receiver(path)?),
            None => None,
        };
        let stderr = match &self.set.stderr {
            Some(path) => Some(pipe::OpenOptions::new().open_receiver(path)?),
            None => None,
        };
        Ok(ClientStreams {
            stdin,
            stdout,
            stderr,
        })
    }

    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {}", self.dir.display(), e);
            }
        }
    }
}

/// Client ends of a process's pipes
pub struct ClientStreams {
    pub stdin: Option<pipe::Sender>,
    pub stdout: Option<pipe::Receiver>,
    pub stderr: Option<pipe::Receiver>,
}

/// Who gets told when the client's stdin reaches EOF
#[derive(Clone)]
pub struct StdinCloser {
    pub runtime: Arc<dyn Runtime>,
    pub namespace: String,
    pub id: String,
    pub exec_id: Option<String>,
}

impl StdinCloser {
    async fn close(&self) {
        if let Err(e) = self
            .runtime
            .close_stdin(&self.namespace, &self.id, self.exec_id.as_deref())
            .await
        {
            debug!("close stdin of {}: {}", self.id, e);
        }
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Local ends of an attach session
pub struct LocalStdio {
    pub stdin: Option<BoxedReader>,
    pub stdout: BoxedWriter,
    pub stderr: BoxedWriter,
    /// Detach sequence filtered out of stdin, if any
    pub detach_keys: Option<Vec<u8>>,
    /// Stdin is a local terminal that can go into raw mode
    pub terminal: bool,
}

impl LocalStdio {
    /// The process's own stdio
    pub fn process(stdin: bool, detach_keys: Option<Vec<u8>>) -> Self {
        Self {
            stdin: if stdin {
                Some(Box::new(tokio::io::stdin()))
            } else {
                None
            },
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
            detach_keys,
            terminal: stdin && std::io::stdin().is_terminal(),
        }
    }
}

/// Running copy tasks of one attach session
pub struct IoSession {
    outputs: Vec<JoinHandle<()>>,
    input: Option<JoinHandle<()>>,
    detached: Option<oneshot::Receiver<()>>,
}

async fn copy_output(mut from: pipe::Receiver, mut to: BoxedWriter) {
    let mut buf = [0u8; 8192];
    loop {
        match from.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if to.write_all(&buf[..n]).await.is_err() || to.flush().await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("output copy ended: {}", e);
                break;
            }
        }
    }
}

async fn copy_input(
    mut from: BoxedReader,
    mut to: pipe::Sender,
    mut scanner: Option<DetachScanner>,
    closer: StdinCloser,
    detached: oneshot::Sender<()>,
) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("stdin copy ended: {}", e);
                break;
            }
        };
        let (data, detach) = match scanner.as_mut() {
            Some(scanner) => scanner.feed(&buf[..n]),
            None => (buf[..n].to_vec(), false),
        };
        if !data.is_empty() && to.write_all(&data).await.is_err() {
            break;
        }
        if detach {
            debug!("detach sequence received");
            let _ = detached.send(());
            return;
        }
    }
    drop(to);
    closer.close().await;
}

impl IoSession {
    /// Start copying between the process's pipes and the local ends
    pub fn start(streams: ClientStreams, local: LocalStdio, closer: StdinCloser) -> Self {
        let mut outputs = Vec::new();
        let LocalStdio {
            stdin,
            stdout,
            stderr,
            detach_keys,
            ..
        } = local;
        if let Some(from) = streams.stdout {
            outputs.push(tokio::spawn(copy_output(from, stdout)));
        }
        if let Some(from) = streams.stderr {
            outputs.push(tokio::spawn(copy_output(from, stderr)));
        }
        let (detach_tx, detach_rx) = oneshot::channel();
        let input = match (stdin, streams.stdin) {
            (Some(from), Some(to)) => Some(tokio::spawn(copy_input(
                from,
                to,
                detach_keys.map(DetachScanner::new),
                closer,
                detach_tx,
            ))),
            _ => None,
        };
        Self {
            outputs,
            input,
            detached: Some(detach_rx),
        }
    }

    /// Resolves when the user typed the detach sequence
    pub async fn detached(&mut self) {
        match self.detached.as_mut() {
            Some(rx) => {
                if rx.await.is_err() {
                    // Stdin ended without detaching.
                    self.detached = None;
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Wait for the output copies to see EOF
    pub async fn drain(mut self) {
        for handle in self.outputs.drain(..) {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                debug!("output copy did not finish in time");
            }
        }
        if let Some(input) = self.input.take() {
            input.abort();
        }
    }

    /// Stop copying without waiting
    pub fn abort(mut self) {
        for handle in self.outputs.drain(..) {
            handle.abort();
        }
        if let Some(input) = self.input.take() {
            input.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_fifo_layout() {
        let temp = tempdir().unwrap();
        let fifos = StdioFifos::create(temp.path().join("io/init"), true, false).unwrap();
        match fifos.task_io() {
            TaskIo::Fifos(set) => {
                assert!(set.stdin.unwrap().ends_with("stdin"));
                assert!(set.stderr.is_some());
                assert!(!set.terminal);
            }
            other => panic!("unexpected io {:?}", other),
        }

        let tty = StdioFifos::create(temp.path().join("io/tty"), false, true).unwrap();
        match tty.task_io() {
            TaskIo::Fifos(set) => {
                assert!(set.stdin.is_none());
                assert!(set.stderr.is_none());
            }
            other => panic!("unexpected io {:?}", other),
        }
        tty.remove();
        assert!(!temp.path().join("io/tty").exists());
    }

    #[tokio::test]
    async fn test_output_eof_after_writer_closes() {
        let temp = tempdir().unwrap();
        let fifos = StdioFifos::create(temp.path().join("io/init"), true, false).unwrap();
        let streams = fifos.open().unwrap();
        assert!(streams.stdin.is_some());

        let TaskIo::Fifos(set) = fifos.task_io() else {
            panic!("expected fifos");
        };
        let mut writer = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(set.stdout.unwrap())
            .unwrap();
        writer.write_all(b"early\n").await.unwrap();
        drop(writer);

        let mut out = String::new();
        let mut stdout = streams.stdout.unwrap();
        let read = stdout.read_to_string(&mut out);
        tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .expect("stdout reached EOF")
            .unwrap();
        assert_eq!(out, "early\n");
        fifos.remove();
    }
}
