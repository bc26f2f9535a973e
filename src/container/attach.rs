//! `attach`: follow a detached container's output and forward signals
//!
//! Detached containers hand their stdio to the log driver, so attaching
//! means tailing the json-file log from the current end while the client
//! relays signals the way a `run` session does.

use super::run::stop_signal;
use super::ContainerManager;
use crate::error::{CtlError, Result};
use crate::logging::reader::{read_json_file, render};
use crate::logging::{LogConfig, LogDriver, LogEntry, LogsOptions};
use crate::signals::{SessionAction, SessionSignals};
use crate::task::{exit_code, LocalStdio};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

impl ContainerManager {
    /// Attach until the container exits (mirroring its exit code) or the
    /// user detaches with a second interrupt
    pub async fn attach(&self, query: &str, local: LocalStdio) -> Result<()> {
        let record = self.resolve(query).await?;
        if !self.state(&record).await?.is_running() {
            return Err(CtlError::NotRunning {
                id: Self::name_of(&record),
            });
        }
        let dir = self.store.container(&record.id);
        let config = LogConfig::load(&dir)?;
        if local.stdin.is_some() {
            warn!("stdin is not forwarded to a detached container");
        }
        let _op = self.router.track(format!("attach {}", record.id));

        let stop = self.cancel_token().child_token();
        let (tx, mut rx) = mpsc::unbounded_channel::<LogEntry>();
        let follower = if config.driver == LogDriver::JsonFile {
            let path = dir.log_path();
            let stop = stop.clone();
            Some(tokio::spawn(async move {
                let opts = LogsOptions {
                    follow: true,
                    tail: Some(0),
                    ..Default::default()
                };
                read_json_file(&path, &opts, &stop, |entry| {
                    tx.send(entry.clone())
                        .map_err(|_| CtlError::Canceled { user: true })
                })
                .await
            }))
        } else {
            warn!("{} log driver output cannot be attached to", config.driver);
            drop(tx);
            None
        };
        let LocalStdio {
            mut stdout,
            mut stderr,
            ..
        } = local;
        let printer = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let line = render(&entry, false);
                let target = if entry.stream == "stderr" {
                    &mut stderr
                } else {
                    &mut stdout
                };
                if target.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = target.flush().await;
            }
        });

        let mut forward = self.router.forward();
        let mut signals = SessionSignals::new(stop_signal(&dir));
        let cancel = self.cancel_token();
        let exit = loop {
            tokio::select! {
                exit = self.runtime.wait_task(self.ns(), &record.id) => break Some(exit?),
                Some(sig) = forward.recv() => match signals.handle(sig, Instant::now()) {
                    SessionAction::Forward(sig) => {
                        if let Err(e) = self.tasks.kill(&record.id, sig, false).await {
                            warn!("cannot forward signal to {}: {}", record.id, e);
                        }
                    }
                    SessionAction::Detach => break None,
                },
                _ = cancel.cancelled() => break None,
            }
        };
        drop(forward);

        stop.cancel();
        if let Some(follower) = follower {
            match follower.await {
                Ok(Err(e)) => debug!("log follower of {} ended: {}", record.id, e),
                Err(e) => debug!("log follower of {} failed: {}", record.id, e),
                Ok(Ok(())) => {}
            }
        }
        let _ = printer.await;

        match exit {
            Some(exit) => match exit_code(&exit) {
                0 => Ok(()),
                code => Err(CtlError::ContainerExit(code)),
            },
            None if cancel.is_cancelled() => Err(CtlError::Canceled { user: true }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{capture, manager, options};
    use crate::error::CtlError;
    use crate::logging::{JsonFileWriter, LogEntry};
    use std::time::Duration;

    #[tokio::test]
    async fn test_attach_follows_until_exit() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["sleep", "1h"]);
        opts.name = Some("attached".into());
        opts.detach = true;
        let (local, _out, _err) = capture(None);
        let id = manager.run(&opts, local).await.unwrap();
        let dir = manager.store().container(&id);
        let mut writer = JsonFileWriter::open(dir.log_path(), 0, 1, false).unwrap();
        writer.write(&LogEntry::new("stdout", "old\n")).unwrap();

        let killer = manager.clone();
        let background = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer.write(&LogEntry::new("stdout", "new\n")).unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
            killer.kill("attached", "KILL").await.unwrap();
        });
        let (local, out, _err) = capture(None);
        let err = manager.attach("attached", local).await.unwrap_err();
        background.await.unwrap();
        assert!(matches!(err, CtlError::ContainerExit(137)));
        assert_eq!(String::from_utf8(out.contents()).unwrap(), "new\n");
    }

    #[tokio::test]
    async fn test_attach_needs_running_container() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["true"]);
        opts.name = Some("created".into());
        manager.create(&opts).await.unwrap();
        let (local, _out, _err) = capture(None);
        assert!(matches!(
            manager.attach("created", local).await.unwrap_err(),
            CtlError::NotRunning { .. }
        ));
    }
}
