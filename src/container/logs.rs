//! `logs`

use super::ContainerManager;
use crate::error::{CtlError, Result};
use crate::logging::reader::{read_json_file, render};
use crate::logging::{journald, LogConfig, LogDriver, LogsOptions};
use std::io::Write;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

impl ContainerManager {
    /// Token cancelled once the container's task exits, or right away when
    /// it is not running
    pub(crate) async fn exit_token(&self, id: &str) -> Result<(CancellationToken, Option<JoinHandle<()>>)> {
        let stop = self.cancel_token().child_token();
        let running = match self.tasks.status(id).await? {
            Some(info) => matches!(
                info.status,
                crate::runtime::TaskStatus::Running | crate::runtime::TaskStatus::Paused
            ),
            None => false,
        };
        if !running {
            stop.cancel();
            return Ok((stop, None));
        }
        let tasks = self.tasks.clone();
        let id = id.to_string();
        let watch = stop.clone();
        let handle = tokio::spawn(async move {
            let _ = tasks.wait(&id, &watch).await;
            watch.cancel();
        });
        Ok((stop, Some(handle)))
    }

    /// `logs`: print the container's log; stderr records go to `err`
    pub async fn logs(
        &self,
        query: &str,
        opts: &LogsOptions,
        out: &mut (dyn Write + Send),
        err: &mut (dyn Write + Send),
    ) -> Result<()> {
        let record = self.resolve(query).await?;
        let dir = self.store.container(&record.id);
        let config = LogConfig::load(&dir)?;
        match config.driver {
            LogDriver::None => Err(CtlError::usage(format!(
                "container {} uses the none log driver, no logs are available",
                Self::name_of(&record)
            ))),
            LogDriver::Journald => journald::read_logs(&record.id, opts).await,
            LogDriver::JsonFile => {
                let (stop, watcher) = self.exit_token(&record.id).await?;
                let result = read_json_file(&dir.log_path(), opts, &stop, |entry| {
                    let line = render(entry, opts.timestamps);
                    let target: &mut (dyn Write + Send) = if entry.stream == "stderr" {
                        &mut *err
                    } else {
                        &mut *out
                    };
                    target.write_all(line.as_bytes())?;
                    Ok(())
                })
                .await;
                if let Some(watcher) = watcher {
                    watcher.abort();
                }
                result?;
                out.flush()?;
                err.flush()?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{capture, manager, options};
    use crate::logging::{JsonFileWriter, LogEntry};
    use crate::logging::LogsOptions;
    use std::time::Duration;

    #[tokio::test]
    async fn test_logs_tail_and_streams() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["true"]);
        opts.name = Some("logged".into());
        let record = manager.create(&opts).await.unwrap();

        let dir = manager.store().container(&record.id);
        let mut writer = JsonFileWriter::open(dir.log_path(), 0, 1, false).unwrap();
        writer.write(&LogEntry::new("stdout", "one\n")).unwrap();
        writer.write(&LogEntry::new("stderr", "oops\n")).unwrap();
        writer.write(&LogEntry::new("stdout", "two\n")).unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        manager
            .logs("logged", &LogsOptions::default(), &mut out, &mut err)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "one\ntwo\n");
        assert_eq!(String::from_utf8(err).unwrap(), "oops\n");

        let mut out = Vec::new();
        let mut err = Vec::new();
        let tail = LogsOptions {
            tail: Some(1),
            ..Default::default()
        };
        manager.logs("logged", &tail, &mut out, &mut err).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "two\n");
        assert!(err.is_empty());
    }

    #[tokio::test]
    async fn test_follow_ends_when_container_stops() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["sleep", "1h"]);
        opts.name = Some("follow".into());
        opts.detach = true;
        let (local, _out, _err) = capture(None);
        let id = manager.run(&opts, local).await.unwrap();
        let dir = manager.store().container(&id);
        let mut writer = JsonFileWriter::open(dir.log_path(), 0, 1, false).unwrap();
        writer.write(&LogEntry::new("stdout", "before\n")).unwrap();

        let stopper = manager.clone();
        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer.write(&LogEntry::new("stdout", "after\n")).unwrap();
            stopper.stop("follow", Some(Duration::from_secs(1))).await.unwrap();
        });
        let follow = LogsOptions {
            follow: true,
            ..Default::default()
        };
        let mut out = Vec::new();
        let mut err = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(10),
            manager.logs("follow", &follow, &mut out, &mut err),
        )
        .await
        .unwrap()
        .unwrap();
        stop.await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "before\nafter\n");
    }

    #[tokio::test]
    async fn test_none_driver_has_no_logs() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["true"]);
        opts.name = Some("quiet".into());
        opts.log_driver = Some("none".into());
        manager.create(&opts).await.unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        assert!(manager
            .logs("quiet", &LogsOptions::default(), &mut out, &mut err)
            .await
            .is_err());
    }
}
