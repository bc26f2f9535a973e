//! `run` and the attach session shared by `start -a`, `attach` and `exec`

use super::config::CreateOptions;
use super::lifecycle::RemoveOptions;
use super::{labels, ContainerManager};
use crate::error::{CtlError, Result};
use crate::runtime::{ContainerRecord, ExitRecord, TaskIo};
use crate::signals::{parse_signal, SessionAction, SessionSignals, SIGTERM};
use crate::store::{ContainerDir, ProcessRecord};
use crate::task::tty::{parse_detach_keys, DEFAULT_DETACH_KEYS};
use crate::task::{
    exit_code, ClientStreams, IoSession, LocalStdio, RawModeGuard, ResizeWatcher, StdinCloser,
    StdioFifos, TerminalSize,
};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Instant;
use tracing::{debug, warn};

/// How an attach session ended
#[derive(Debug)]
pub enum SessionEnd {
    Exited(ExitRecord),
    /// The user detached; the process keeps running
    Detached,
}

/// Local side of a session: copies plus the terminal state
pub(crate) struct Session {
    io: IoSession,
    resize: Option<ResizeWatcher>,
    // Declared last so the terminal is restored after the copies stop.
    _raw: Option<RawModeGuard>,
}

impl Session {
    /// Stop copying; the process is not touched
    pub(crate) fn abort(self) {
        self.io.abort();
    }
}

/// Process a session is attached to
pub(crate) struct SessionTarget {
    pub id: String,
    pub exec_id: Option<String>,
    pub tty: bool,
    pub stop_signal: i32,
}

/// Detach sequence for a session; only TTY sessions have one
pub fn detach_keys(tty: bool, value: Option<&str>) -> Result<Option<Vec<u8>>> {
    if !tty {
        return Ok(None);
    }
    parse_detach_keys(value.unwrap_or(DEFAULT_DETACH_KEYS)).map(Some)
}

pub(crate) fn argv0(record: &ContainerRecord) -> String {
    record
        .spec
        .process()
        .as_ref()
        .and_then(|p| p.args().as_ref())
        .and_then(|a| a.first().cloned())
        .unwrap_or_default()
}

pub(crate) fn has_terminal(record: &ContainerRecord) -> bool {
    record
        .spec
        .process()
        .as_ref()
        .and_then(|p| p.terminal())
        .unwrap_or(false)
}

/// Configured stop signal; SIGTERM when unset or unreadable
pub(crate) fn stop_signal(dir: &ContainerDir) -> i32 {
    dir.stop_signal()
        .ok()
        .flatten()
        .and_then(|s| parse_signal(&s).ok())
        .unwrap_or(SIGTERM)
}

/// Persist what the client saw of the init process's exit
pub(crate) fn record_exit(dir: &ContainerDir, exit: &ExitRecord) {
    let mut record = dir.process_record().unwrap_or_default();
    record.finished_at = Some(exit.exited_at);
    record.exit_code = Some(exit_code(exit));
    if let Err(e) = dir.save_process_record(&record) {
        warn!("cannot record exit of {}: {}", dir.id(), e);
    }
}

impl ContainerManager {
    /// `run`: create, start and, unless detached, attach and wait
    ///
    /// Returns the container ID. An attached container that exits non-zero
    /// surfaces as [`CtlError::ContainerExit`] so the client mirrors it.
    pub async fn run(&self, opts: &CreateOptions, local: LocalStdio) -> Result<String> {
        let record = self.create(opts).await?;
        let id = record.id.clone();
        if opts.detach {
            if let Err(e) = self.start_detached(&record).await {
                debug!("detached start of {} failed: {}", id, e);
                return Err(e);
            }
            return Ok(id);
        }

        let _op = self.router.track(format!("run {}", id));
        let outcome = self.run_attached(&record, opts.interactive, local).await;
        let finished = match &outcome {
            Ok(SessionEnd::Exited(_)) => true,
            Ok(SessionEnd::Detached) | Err(CtlError::Canceled { .. }) => false,
            Err(_) => true,
        };
        if opts.rm && finished {
            if let Err(e) = self.remove_record(&record, &RemoveOptions::auto_remove()).await {
                warn!("cannot remove {}: {}", id, e);
            }
        }
        match outcome? {
            SessionEnd::Exited(exit) => match exit_code(&exit) {
                0 => Ok(id),
                code => Err(CtlError::ContainerExit(code)),
            },
            SessionEnd::Detached => Ok(id),
        }
    }

    /// Start the init process with its output going to the log driver
    pub(crate) async fn start_detached(&self, record: &ContainerRecord) -> Result<()> {
        self.tasks.delete(&record.id).await?;
        let io = match record.label(labels::LOG_URI) {
            Some(uri) => TaskIo::Log {
                uri: uri.to_string(),
            },
            None => TaskIo::Null,
        };
        let pid = self.tasks.create(&record.id, io).await?;
        self.start_recorded(record, pid).await
    }

    /// Start the created task and remember when
    async fn start_recorded(&self, record: &ContainerRecord, pid: u32) -> Result<()> {
        let dir = self.store.container(&record.id);
        dir.save_process_record(&ProcessRecord {
            pid,
            started_at: Some(Utc::now()),
            finished_at: None,
            exit_code: None,
        })?;
        if let Err(e) = self.tasks.start(&record.id, &argv0(record)).await {
            dir.save_process_record(&ProcessRecord::default())?;
            return Err(e);
        }
        Ok(())
    }

    /// Start the init process attached to `local` and supervise it
    pub(crate) async fn run_attached(
        &self,
        record: &ContainerRecord,
        stdin: bool,
        local: LocalStdio,
    ) -> Result<SessionEnd> {
        let dir = self.store.container(&record.id);
        let tty = has_terminal(record);
        let fifos = StdioFifos::create(dir.io_dir("init"), stdin, tty)?;
        let result = self.attached_task(record, &fifos, local).await;
        fifos.remove();
        result
    }

    async fn attached_task(
        &self,
        record: &ContainerRecord,
        fifos: &StdioFifos,
        local: LocalStdio,
    ) -> Result<SessionEnd> {
        let id = record.id.clone();
        let dir = self.store.container(&id);
        self.tasks.delete(&id).await?;
        let streams = fifos.open()?;
        let pid = self.tasks.create(&id, fifos.task_io()).await?;
        let tty = fifos.terminal();
        let session = self.open_session(&id, None, streams, local, tty)?;
        if let Err(e) = self.start_recorded(record, pid).await {
            session.abort();
            return Err(e);
        }
        let end = self
            .supervise(
                session,
                SessionTarget {
                    id,
                    exec_id: None,
                    tty,
                    stop_signal: stop_signal(&dir),
                },
            )
            .await?;
        if let SessionEnd::Exited(exit) = &end {
            record_exit(&dir, exit);
        }
        Ok(end)
    }

    /// Begin copying between the process and the local ends
    pub(crate) fn open_session(
        &self,
        id: &str,
        exec_id: Option<&str>,
        streams: ClientStreams,
        local: LocalStdio,
        tty: bool,
    ) -> Result<Session> {
        let interactive_terminal = tty && local.terminal;
        let raw = if interactive_terminal {
            Some(RawModeGuard::new()?)
        } else {
            None
        };
        let resize = if interactive_terminal {
            ResizeWatcher::new().ok()
        } else {
            None
        };
        let closer = StdinCloser {
            runtime: self.runtime.clone(),
            namespace: self.ns().to_string(),
            id: id.to_string(),
            exec_id: exec_id.map(str::to_string),
        };
        Ok(Session {
            io: IoSession::start(streams, local, closer),
            resize,
            _raw: raw,
        })
    }

    fn wait_future(&self, target: &SessionTarget) -> BoxFuture<'static, Result<ExitRecord>> {
        let runtime = self.runtime.clone();
        let ns = self.ns().to_string();
        let id = target.id.clone();
        match target.exec_id.clone() {
            Some(exec_id) => async move { runtime.wait_process(&ns, &id, &exec_id).await }.boxed(),
            None => async move { runtime.wait_task(&ns, &id).await }.boxed(),
        }
    }

    async fn signal_target(&self, target: &SessionTarget, sig: i32) {
        let ns = self.ns();
        let result = match &target.exec_id {
            Some(exec_id) => self.runtime.kill_process(ns, &target.id, exec_id, sig).await,
            None => self.runtime.kill_task(ns, &target.id, sig, false).await,
        };
        if let Err(e) = result {
            warn!("cannot forward signal {} to {}: {}", sig, target.id, e);
        }
    }

    async fn resize(&self, target: &SessionTarget, size: TerminalSize) {
        if let Err(e) = self
            .runtime
            .resize_pty(
                self.ns(),
                &target.id,
                target.exec_id.as_deref(),
                size.cols,
                size.rows,
            )
            .await
        {
            debug!("resize of {} failed: {}", target.id, e);
        }
    }

    /// Route signals and resizes until the process exits or the user
    /// detaches
    pub(crate) async fn supervise(
        &self,
        session: Session,
        target: SessionTarget,
    ) -> Result<SessionEnd> {
        let Session {
            mut io,
            mut resize,
            _raw,
        } = session;
        let cancel = self.cancel_token();
        let mut forward = self.router.forward();
        let mut signals = SessionSignals::new(target.stop_signal);
        if target.tty && resize.is_some() {
            if let Some(size) = TerminalSize::current() {
                self.resize(&target, size).await;
            }
        }

        let mut wait = self.wait_future(&target);
        let end = loop {
            let next_size = async {
                match resize.as_mut() {
                    Some(watcher) => watcher.recv().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                exit = &mut wait => break SessionEnd::Exited(exit?),
                _ = io.detached() => {
                    debug!("detached from {}", target.id);
                    break SessionEnd::Detached;
                }
                Some(sig) = forward.recv() => match signals.handle(sig, Instant::now()) {
                    SessionAction::Forward(sig) => self.signal_target(&target, sig).await,
                    SessionAction::Detach => {
                        debug!("second interrupt, detaching from {}", target.id);
                        break SessionEnd::Detached;
                    }
                },
                Some(size) = next_size => self.resize(&target, size).await,
                _ = cancel.cancelled() => {
                    io.abort();
                    return Err(CtlError::Canceled { user: true });
                }
            }
        };
        drop(forward);
        drop(resize);
        match &end {
            SessionEnd::Exited(_) => io.drain().await,
            SessionEnd::Detached => io.abort(),
        }
        Ok(end)
    }
}
