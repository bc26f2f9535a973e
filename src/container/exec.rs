//! `exec`: run an extra process in a running container

use super::run::{stop_signal, SessionEnd, SessionTarget};
use super::{new_id, ContainerManager, ContainerStatus};
use crate::error::{CtlError, Result};
use crate::runtime::{ExecRequest, TaskIo};
use crate::spec::{self, ExecOptions, RootfsView};
use crate::task::{classify_start_error, exit_code, LocalStdio, StdioFifos};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Flags of `exec`
#[derive(Debug, Clone, Default)]
pub struct ExecRequestOptions {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub interactive: bool,
    pub detach: bool,
    pub privileged: bool,
}

impl ExecRequestOptions {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }
}

impl ContainerManager {
    /// `exec`; an attached process that exits non-zero surfaces as
    /// [`CtlError::ContainerExit`]
    pub async fn exec(&self, query: &str, opts: &ExecRequestOptions, local: LocalStdio) -> Result<()> {
        let record = self.resolve(query).await?;
        match self.state(&record).await?.status {
            ContainerStatus::Running => {}
            ContainerStatus::Paused => {
                return Err(CtlError::Paused {
                    id: Self::name_of(&record),
                    action: "exec".into(),
                })
            }
            _ => {
                return Err(CtlError::NotRunning {
                    id: Self::name_of(&record),
                })
            }
        }
        let base = record
            .spec
            .process()
            .as_ref()
            .ok_or_else(|| CtlError::internal(format!("container {} has no process", record.id)))?;
        let mounts = self
            .runtime
            .snapshot_mounts(self.ns(), &record.snapshotter, &record.snapshot_key)
            .await?;
        let rootfs = RootfsView::from_mounts(&mounts);
        let process = spec::exec_process(
            base,
            &ExecOptions {
                args: opts.args.clone(),
                env: opts.env.clone(),
                env_files: opts.env_files.clone(),
                workdir: opts.workdir.clone(),
                user: opts.user.clone(),
                tty: opts.tty,
                privileged: opts.privileged,
            },
            &rootfs,
        )?;
        let argv0 = opts.args.first().cloned().unwrap_or_default();
        let exec_id = format!("exec-{}", &new_id()[..12]);
        let _op = self
            .router
            .track(format!("exec {} in {}", exec_id, record.id));

        if opts.detach {
            self.runtime
                .exec_process(
                    self.ns(),
                    &record.id,
                    ExecRequest {
                        exec_id: exec_id.clone(),
                        process,
                        io: TaskIo::Null,
                    },
                )
                .await?;
            self.runtime
                .start_process(self.ns(), &record.id, &exec_id)
                .await
                .map_err(|e| classify_start_error(e, &argv0))?;
            debug!("started detached {} in {}", exec_id, record.id);
            return Ok(());
        }

        let dir = self.store.container(&record.id);
        let fifos = StdioFifos::create(dir.io_dir(&exec_id), opts.interactive, opts.tty)?;
        let result = async {
            let streams = fifos.open()?;
            self.runtime
                .exec_process(
                    self.ns(),
                    &record.id,
                    ExecRequest {
                        exec_id: exec_id.clone(),
                        process,
                        io: fifos.task_io(),
                    },
                )
                .await?;
            let session =
                self.open_session(&record.id, Some(&exec_id), streams, local, opts.tty)?;
            if let Err(e) = self
                .runtime
                .start_process(self.ns(), &record.id, &exec_id)
                .await
            {
                session.abort();
                return Err(classify_start_error(e, &argv0));
            }
            self.supervise(
                session,
                SessionTarget {
                    id: record.id.clone(),
                    exec_id: Some(exec_id.clone()),
                    tty: opts.tty,
                    stop_signal: stop_signal(&dir),
                },
            )
            .await
        }
        .await;

        if !matches!(result, Ok(SessionEnd::Detached)) {
            if let Err(e) = self
                .runtime
                .delete_process(self.ns(), &record.id, &exec_id)
                .await
            {
                if !e.is_not_found() {
                    warn!("cannot delete {} of {}: {}", exec_id, record.id, e);
                }
            }
        }
        fifos.remove();
        match result? {
            SessionEnd::Exited(exit) => match exit_code(&exit) {
                0 => Ok(()),
                code => Err(CtlError::ContainerExit(code)),
            },
            SessionEnd::Detached => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{capture, manager, options};
    use super::*;

    async fn sleeper(manager: &ContainerManager, name: &str) {
        let mut opts = options(&["sleep", "1h"]);
        opts.name = Some(name.into());
        opts.detach = true;
        let (local, _out, _err) = capture(None);
        manager.run(&opts, local).await.unwrap();
    }

    fn args(list: &[&str]) -> ExecRequestOptions {
        ExecRequestOptions::new(list.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn test_exec_output() {
        let (manager, _runtime, _temp) = manager();
        sleeper(&manager, "c3").await;
        let (local, out, _err) = capture(None);
        manager
            .exec("c3", &args(&["echo", "success"]), local)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out.contents()).unwrap(), "success\n");
    }

    #[tokio::test]
    async fn test_exec_exit_codes() {
        let (manager, _runtime, _temp) = manager();
        sleeper(&manager, "c5").await;
        let (local, _out, _err) = capture(None);
        let err = manager
            .exec("c5", &args(&["sh", "-c", "exit 7"]), local)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 7);

        let (local, _out, _err) = capture(None);
        let err = manager
            .exec("c5", &args(&["nonexistent-tool"]), local)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 127);
    }

    #[tokio::test]
    async fn test_exec_needs_running_container() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["true"]);
        opts.name = Some("idle".into());
        manager.create(&opts).await.unwrap();
        let (local, _out, _err) = capture(None);
        let err = manager
            .exec("idle", &args(&["echo", "hi"]), local)
            .await
            .unwrap_err();
        assert!(matches!(err, CtlError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_exec_user_must_exist() {
        let (manager, _runtime, _temp) = manager();
        sleeper(&manager, "c6").await;
        let mut opts = args(&["id"]);
        opts.user = Some("nobody-here".into());
        let (local, _out, _err) = capture(None);
        let err = manager.exec("c6", &opts, local).await.unwrap_err();
        assert!(matches!(err, CtlError::UserNotFound(_)));
    }
}
