//! Task control
//!
//! The runtime splits a container into metadata and a task (the live
//! process). [`TaskController`] drives the task side of that split: it never
//! caches state, every decision re-queries the runtime.

pub mod exit;
pub mod io;
pub mod tty;

pub use exit::{classify_start_error, exit_code};
pub use io::{ClientStreams, IoSession, LocalStdio, StdinCloser, StdioFifos};
pub use tty::{RawModeGuard, ResizeWatcher, TerminalSize};

use crate::error::{CtlError, Result};
use crate::runtime::{ExitRecord, Runtime, TaskInfo, TaskIo, TaskStatus};
use crate::signals::{signal_name, SIGKILL};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default grace period of `stop`
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives one namespace's tasks through create, start, wait and delete
#[derive(Clone)]
pub struct TaskController {
    runtime: Arc<dyn Runtime>,
    namespace: String,
}

impl TaskController {
    pub fn new(runtime: Arc<dyn Runtime>, namespace: impl Into<String>) -> Self {
        Self {
            runtime,
            namespace: namespace.into(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current task, or `None` when the container has no task
    pub async fn status(&self, id: &str) -> Result<Option<TaskInfo>> {
        match self.runtime.task_status(&self.namespace, id).await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create the task; returns the init pid
    pub async fn create(&self, id: &str, io: TaskIo) -> Result<u32> {
        let pid = self.runtime.create_task(&self.namespace, id, io).await?;
        debug!("created task {} with pid {}", id, pid);
        Ok(pid)
    }

    /// Start a created task
    ///
    /// `command` names argv[0] in 126/127 errors.
    pub async fn start(&self, id: &str, command: &str) -> Result<()> {
        self.runtime
            .start_task(&self.namespace, id)
            .await
            .map_err(|e| classify_start_error(e, command))?;
        info!("started {}", id);
        Ok(())
    }

    /// Wait for the task to exit, or for `cancel`
    pub async fn wait(&self, id: &str, cancel: &CancellationToken) -> Result<ExitRecord> {
        tokio::select! {
            exit = self.runtime.wait_task(&self.namespace, id) => exit,
            _ = cancel.cancelled() => Err(CtlError::Canceled { user: true }),
        }
    }

    pub async fn kill(&self, id: &str, signal: i32, all: bool) -> Result<()> {
        debug!("sending {} to {}", signal_name(signal), id);
        self.runtime
            .kill_task(&self.namespace, id, signal, all)
            .await
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.runtime.pause_task(&self.namespace, id).await
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.runtime.resume_task(&self.namespace, id).await
    }

    /// Delete the task; a missing task is not an error
    pub async fn delete(&self, id: &str) -> Result<Option<ExitRecord>> {
        match self.runtime.delete_task(&self.namespace, id).await {
            Ok(exit) => Ok(exit),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Send `signal`, wait up to `timeout`, then SIGKILL; the task is deleted
    /// afterwards
    ///
    /// Returns the exit record, or `None` when there was no task.
    pub async fn stop(
        &self,
        id: &str,
        signal: i32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<ExitRecord>> {
        let Some(info) = self.status(id).await? else {
            return Ok(None);
        };
        if info.status != TaskStatus::Stopped {
            self.terminate(id, &info, signal, timeout, cancel).await?;
        }
        let exit = self.delete(id).await?;
        Ok(exit.or(info.exit))
    }

    async fn terminate(
        &self,
        id: &str,
        info: &TaskInfo,
        signal: i32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if info.status == TaskStatus::Created {
            // Never started: the kill stops it in place.
            return self.kill_ignoring_finished(id, SIGKILL).await;
        }
        if !timeout.is_zero() {
            self.kill_ignoring_finished(id, signal).await?;
            if info.status == TaskStatus::Paused {
                self.resume(id).await?;
            }
            let waited = tokio::select! {
                waited = tokio::time::timeout(timeout, self.runtime.wait_task(&self.namespace, id)) => waited,
                _ = cancel.cancelled() => return Err(CtlError::Canceled { user: true }),
            };
            match waited {
                Ok(exit) => {
                    exit?;
                    return Ok(());
                }
                Err(_) => info!(
                    "{} did not exit within {:?} of {}, killing",
                    id,
                    timeout,
                    signal_name(signal)
                ),
            }
        }
        self.kill_ignoring_finished(id, SIGKILL).await?;
        if info.status == TaskStatus::Paused && timeout.is_zero() {
            self.resume(id).await?;
        }
        tokio::select! {
            exit = self.runtime.wait_task(&self.namespace, id) => exit.map(|_| ()),
            _ = cancel.cancelled() => Err(CtlError::Canceled { user: true }),
        }
    }

    async fn kill_ignoring_finished(&self, id: &str, signal: i32) -> Result<()> {
        match self.kill(id, signal, true).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}
