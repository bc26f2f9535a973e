//! start, stop, restart, kill, pause, unpause, wait, rm and rename

use super::run::{record_exit, stop_signal, SessionEnd};
use super::{is_valid_name, json_list, labels, ContainerManager, ContainerStatus};
use crate::error::{CtlError, ObjectKind, Result};
use crate::runtime::ContainerRecord;
use crate::sequencer::Sequencer;
use crate::signals::{parse_signal, SIGKILL};
use crate::task::{exit_code, LocalStdio, DEFAULT_STOP_TIMEOUT};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Flags of `rm`
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Kill a running container instead of refusing
    pub force: bool,
    /// Also remove the container's anonymous volumes
    pub volumes: bool,
}

impl RemoveOptions {
    /// What `--rm` does once the container has exited
    pub fn auto_remove() -> Self {
        Self {
            force: true,
            volumes: true,
        }
    }
}

fn collect_failures<T>(results: Vec<(String, Result<T>)>) -> Result<Vec<T>> {
    let mut done = Vec::new();
    let mut failures = Vec::new();
    for (query, result) in results {
        match result {
            Ok(value) => done.push(value),
            Err(e) => failures.push((query, e)),
        }
    }
    match failures.len() {
        0 => Ok(done),
        1 => Err(failures.remove(0).1),
        _ => Err(CtlError::Multiple(failures)),
    }
}

impl ContainerManager {
    /// `start`; with `attach` the client streams the output and mirrors the
    /// exit code like `run`
    pub async fn start(&self, query: &str, attach: Option<LocalStdio>) -> Result<String> {
        let record = self.resolve(query).await?;
        let state = self.state(&record).await?;
        match state.status {
            ContainerStatus::Running => {
                debug!("{} is already running", record.id);
                return Ok(record.id);
            }
            ContainerStatus::Paused => {
                return Err(CtlError::Paused {
                    id: Self::name_of(&record),
                    action: "starting".into(),
                })
            }
            ContainerStatus::Created | ContainerStatus::Exited => {}
        }
        self.mark_explicitly_stopped(&record, false).await?;

        let Some(local) = attach else {
            self.start_detached(&record).await?;
            return Ok(record.id);
        };
        let _op = self.router.track(format!("start {}", record.id));
        let stdin = local.stdin.is_some();
        let end = self.run_attached(&record, stdin, local).await;
        let auto_remove = record.label(labels::AUTO_REMOVE) == Some("true");
        if auto_remove && matches!(end, Ok(SessionEnd::Exited(_))) {
            self.remove_record(&record, &RemoveOptions::auto_remove())
                .await?;
        }
        match end? {
            SessionEnd::Exited(exit) => match exit_code(&exit) {
                0 => Ok(record.id),
                code => Err(CtlError::ContainerExit(code)),
            },
            SessionEnd::Detached => Ok(record.id),
        }
    }

    /// Graceful stop timeout: explicit value, then the one given at create
    fn stop_timeout(record: &ContainerRecord, timeout: Option<Duration>) -> Duration {
        timeout
            .or_else(|| {
                record
                    .label(labels::STOP_TIMEOUT)
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
            })
            .unwrap_or(DEFAULT_STOP_TIMEOUT)
    }

    /// `stop`: stop signal, then SIGKILL after the timeout
    pub async fn stop(&self, query: &str, timeout: Option<Duration>) -> Result<String> {
        let record = self.resolve(query).await?;
        let _op = self.router.track(format!("stop {}", record.id));
        self.mark_explicitly_stopped(&record, true).await?;
        self.stop_record(&record, timeout).await?;
        if record.label(labels::AUTO_REMOVE) == Some("true") {
            self.remove_record(&record, &RemoveOptions::auto_remove())
                .await?;
        }
        Ok(record.id)
    }

    async fn stop_record(&self, record: &ContainerRecord, timeout: Option<Duration>) -> Result<()> {
        let dir = self.store.container(&record.id);
        let signal = stop_signal(&dir);
        let timeout = Self::stop_timeout(record, timeout);
        let exit = self
            .tasks
            .stop(&record.id, signal, timeout, &self.cancel_token())
            .await?;
        if let Some(exit) = exit {
            record_exit(&dir, &exit);
            info!("stopped {} ({})", record.id, exit_code(&exit));
        }
        Ok(())
    }

    /// `restart`: stop if needed, then start detached
    pub async fn restart(&self, query: &str, timeout: Option<Duration>) -> Result<String> {
        let record = self.resolve(query).await?;
        let _op = self.router.track(format!("restart {}", record.id));
        self.stop_record(&record, timeout).await?;
        self.mark_explicitly_stopped(&record, false).await?;
        self.start_detached(&record).await?;
        Ok(record.id)
    }

    /// `kill`: deliver a signal to a running container
    pub async fn kill(&self, query: &str, signal: &str) -> Result<String> {
        let sig = parse_signal(signal)?;
        let record = self.resolve(query).await?;
        if !self.state(&record).await?.is_running() {
            return Err(CtlError::NotRunning {
                id: Self::name_of(&record),
            });
        }
        self.tasks.kill(&record.id, sig, false).await?;
        Ok(record.id)
    }

    pub async fn pause(&self, query: &str) -> Result<String> {
        let record = self.resolve(query).await?;
        match self.state(&record).await?.status {
            ContainerStatus::Running => {}
            ContainerStatus::Paused => {
                return Err(CtlError::conflict(
                    format!("container {} is already paused", Self::name_of(&record)),
                    "",
                ))
            }
            _ => {
                return Err(CtlError::NotRunning {
                    id: Self::name_of(&record),
                })
            }
        }
        self.tasks.pause(&record.id).await?;
        Ok(record.id)
    }

    pub async fn unpause(&self, query: &str) -> Result<String> {
        let record = self.resolve(query).await?;
        if self.state(&record).await?.status != ContainerStatus::Paused {
            return Err(CtlError::conflict(
                format!("container {} is not paused", Self::name_of(&record)),
                "",
            ));
        }
        self.tasks.resume(&record.id).await?;
        Ok(record.id)
    }

    /// `wait`: block until every container exits; returns their exit codes
    /// in argument order
    pub async fn wait(&self, queries: &[String]) -> Result<Vec<i32>> {
        let mut records = Vec::new();
        for query in queries {
            records.push(self.resolve(query).await?);
        }
        let codes = Arc::new(Mutex::new(BTreeMap::new()));
        let mut sequencer = Sequencer::new(0);
        for (index, record) in records.into_iter().enumerate() {
            let manager = self.clone();
            let codes = codes.clone();
            sequencer.add(
                format!("{}#{}", queries[index], index),
                Vec::new(),
                move || {
                    async move {
                        let code = manager.wait_record(&record).await?;
                        codes
                            .lock()
                            .map_err(|_| CtlError::Lock("wait results".into()))?
                            .insert(index, code);
                        Ok(())
                    }
                    .boxed()
                },
            );
        }
        sequencer.run(&self.cancel_token()).await?.into_result()?;
        let codes = codes
            .lock()
            .map_err(|_| CtlError::Lock("wait results".into()))?;
        Ok(codes.values().copied().collect())
    }

    async fn wait_record(&self, record: &ContainerRecord) -> Result<i32> {
        let dir = self.store.container(&record.id);
        let code = match self.tasks.status(&record.id).await? {
            Some(_) => {
                let exit = self.tasks.wait(&record.id, &self.cancel_token()).await?;
                record_exit(&dir, &exit);
                exit_code(&exit)
            }
            None => dir.process_record().unwrap_or_default().exit_code.unwrap_or(0),
        };
        if record.label(labels::AUTO_REMOVE) == Some("true") {
            self.remove_record(record, &RemoveOptions::auto_remove())
                .await?;
        }
        Ok(code)
    }

    /// `rm`: remove every container, reporting all failures at the end
    pub async fn rm(&self, queries: &[String], opts: &RemoveOptions) -> Result<Vec<String>> {
        let mut results = Vec::new();
        for query in queries {
            let result = match self.resolver().container(query).await {
                Ok(record) => self
                    .remove_record(&record, opts)
                    .await
                    .map(|()| query.clone()),
                Err(e) => Err(e),
            };
            results.push((query.clone(), result));
        }
        collect_failures(results)
    }

    /// Remove a container and everything the client allocated for it
    pub(crate) async fn remove_record(
        &self,
        record: &ContainerRecord,
        opts: &RemoveOptions,
    ) -> Result<()> {
        let name = Self::name_of(record);
        let state = self.state(record).await?;
        if state.is_running() && !opts.force {
            return Err(CtlError::conflict(
                format!("container {} is {}", name, state.status),
                "stop the container before removing it, or use --force",
            ));
        }
        self.tasks
            .stop(&record.id, SIGKILL, Duration::ZERO, &self.cancel_token())
            .await?;
        match self.runtime.delete_container(self.ns(), &record.id).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }

        let dir = self.store.container(&record.id);
        if let Err(e) = self.network.release(&dir) {
            warn!("cannot release network endpoints of {}: {}", record.id, e);
        }
        if let Err(e) = self.store.hosts().remove(&record.id) {
            warn!("cannot remove hosts file of {}: {}", record.id, e);
        }
        let auto_remove = record.label(labels::AUTO_REMOVE) == Some("true");
        if opts.volumes || auto_remove {
            let volumes = self.store.volumes();
            for volume in json_list(record, labels::ANON_VOLUMES) {
                if let Err(e) = volumes.remove(&volume) {
                    warn!("cannot remove anonymous volume {}: {}", volume, e);
                }
            }
        }
        if let Err(e) = dir.remove() {
            warn!("cannot remove state of {}: {}", record.id, e);
        }
        if let Some(name) = record.label(labels::NAME) {
            self.store
                .names()
                .release(ObjectKind::Container, name, &record.id)?;
        }
        info!("removed {}", record.id);
        Ok(())
    }

    /// `rename`
    pub async fn rename(&self, query: &str, new_name: &str) -> Result<()> {
        if !is_valid_name(new_name) {
            return Err(CtlError::usage(format!(
                "invalid container name {:?}, must match [a-zA-Z0-9][a-zA-Z0-9_.-]+",
                new_name
            )));
        }
        let record = self.resolve(query).await?;
        let old = Self::name_of(&record);
        let names = self.store.names();
        names.rename(ObjectKind::Container, &old, new_name, &record.id)?;
        let update = BTreeMap::from([(labels::NAME.to_string(), new_name.to_string())]);
        if let Err(e) = self.runtime.update_labels(self.ns(), &record.id, update).await {
            if let Err(undo) = names.rename(ObjectKind::Container, new_name, &old, &record.id) {
                warn!("cannot restore name {} of {}: {}", old, record.id, undo);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Keep the restart monitor's view in line with what the user asked for
    async fn mark_explicitly_stopped(&self, record: &ContainerRecord, stopped: bool) -> Result<()> {
        if record.label(labels::RESTART_POLICY).is_none() {
            return Ok(());
        }
        let (status, explicit) = if stopped {
            ("stopped", "true")
        } else {
            ("running", "")
        };
        let update = BTreeMap::from([
            (labels::RESTART_STATUS.to_string(), status.to_string()),
            (
                labels::RESTART_EXPLICITLY_STOPPED.to_string(),
                explicit.to_string(),
            ),
        ]);
        self.runtime
            .update_labels(self.ns(), &record.id, update)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{manager, options};
    use super::super::RestartPolicy;
    use super::*;
    use crate::runtime::Runtime;
    use crate::spec::mounts::MountRequests;

    async fn run_detached(manager: &ContainerManager, name: &str, args: &[&str]) -> String {
        let mut opts = options(args);
        opts.name = Some(name.into());
        opts.detach = true;
        let (local, _out, _err) = super::super::tests::capture(None);
        manager.run(&opts, local).await.unwrap()
    }

    #[tokio::test]
    async fn test_stop_start_produces_independent_runs() {
        let (manager, _runtime, _temp) = manager();
        run_detached(&manager, "c1", &["sleep", "1h"]).await;

        let record = manager.resolve("c1").await.unwrap();
        let first = manager.state(&record).await.unwrap();
        manager.stop("c1", Some(Duration::from_secs(5))).await.unwrap();
        let stopped = manager.state(&record).await.unwrap();
        assert_eq!(stopped.status, ContainerStatus::Exited);
        assert_eq!(stopped.pid, 0);
        assert!(stopped.finished_at.is_some());

        manager.start("c1", None).await.unwrap();
        let second = manager.state(&record).await.unwrap();
        assert_eq!(second.status, ContainerStatus::Running);
        assert_ne!(first.pid, second.pid);
        manager.stop("c1", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_escalates_when_term_is_ignored() {
        let (manager, _runtime, _temp) = manager();
        run_detached(&manager, "stubborn", &["sh", "-c", "trap '' TERM; sleep 1h"]).await;
        let started = std::time::Instant::now();
        manager
            .stop("stubborn", Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        let record = manager.resolve("stubborn").await.unwrap();
        assert_eq!(manager.state(&record).await.unwrap().exit_code, 137);
    }

    #[tokio::test]
    async fn test_rm_running_needs_force() {
        let (manager, runtime, _temp) = manager();
        run_detached(&manager, "c2", &["sleep", "1h"]).await;
        let err = manager
            .rm(&["c2".to_string()], &RemoveOptions::default())
            .await
            .unwrap_err();
        assert!(err.hint().is_some());

        let removed = manager
            .rm(
                &["c2".to_string()],
                &RemoveOptions {
                    force: true,
                    volumes: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(removed, vec!["c2".to_string()]);
        assert!(runtime.list_containers("default").await.unwrap().is_empty());
        assert!(manager
            .store()
            .names()
            .reserve(ObjectKind::Container, "c2", "other")
            .is_ok());
    }

    #[tokio::test]
    async fn test_rm_reports_every_failure() {
        let (manager, _runtime, _temp) = manager();
        let err = manager
            .rm(&["nope1".to_string(), "nope2".to_string()], &RemoveOptions::default())
            .await
            .unwrap_err();
        match err {
            CtlError::Multiple(failures) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected {}", other),
        }
    }

    #[tokio::test]
    async fn test_rm_volumes_removes_anonymous_only() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["true"]);
        opts.name = Some("vols".into());
        opts.mounts = MountRequests {
            volumes: vec!["/scratch".into(), "keep:/data".into()],
            ..Default::default()
        };
        manager.create(&opts).await.unwrap();
        let volumes = manager.store().volumes();
        assert_eq!(volumes.list().unwrap().len(), 2);

        manager
            .rm(
                &["vols".to_string()],
                &RemoveOptions {
                    force: false,
                    volumes: true,
                },
            )
            .await
            .unwrap();
        let left: Vec<_> = volumes.list().unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(left, vec!["keep".to_string()]);
    }

    #[tokio::test]
    async fn test_rename_round_trip() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["true"]);
        opts.name = Some("alpha".into());
        let record = manager.create(&opts).await.unwrap();

        manager.rename("alpha", "bravo").await.unwrap();
        assert!(manager.resolve("alpha").await.unwrap_err().is_not_found());
        let renamed = manager.resolve("bravo").await.unwrap();
        assert_eq!(renamed.id, record.id);
        assert_eq!(ContainerManager::name_of(&renamed), "bravo");

        manager.rename("bravo", "alpha").await.unwrap();
        assert_eq!(manager.resolve("alpha").await.unwrap().id, record.id);
        let names = manager.store().names();
        assert!(names.lookup(ObjectKind::Container, "bravo").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pause_unpause_and_kill() {
        let (manager, _runtime, _temp) = manager();
        run_detached(&manager, "p1", &["sleep", "1h"]).await;
        manager.pause("p1").await.unwrap();
        assert!(manager.pause("p1").await.is_err());

        let err = manager.start("p1", None).await.unwrap_err();
        assert!(err.to_string().contains("is paused"));

        manager.unpause("p1").await.unwrap();
        assert!(manager.unpause("p1").await.is_err());

        manager.kill("p1", "SIGKILL").await.unwrap();
        let codes = manager.wait(&["p1".to_string()]).await.unwrap();
        assert_eq!(codes, vec![137]);
        let err = manager.kill("p1", "KILL").await.unwrap_err();
        assert!(matches!(err, CtlError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_wait_many() {
        let (manager, _runtime, _temp) = manager();
        run_detached(&manager, "w1", &["sh", "-c", "exit 3"]).await;
        run_detached(&manager, "w2", &["true"]).await;
        let codes = manager
            .wait(&["w1".to_string(), "w2".to_string()])
            .await
            .unwrap();
        assert_eq!(codes, vec![3, 0]);
    }

    #[tokio::test]
    async fn test_restart_labels_follow_stop_and_start() {
        let (manager, runtime, _temp) = manager();
        let mut opts = options(&["sleep", "1h"]);
        opts.name = Some("svc".into());
        opts.detach = true;
        opts.restart = RestartPolicy::Always;
        let (local, _out, _err) = super::super::tests::capture(None);
        let id = manager.run(&opts, local).await.unwrap();

        manager.stop("svc", Some(Duration::from_secs(1))).await.unwrap();
        let record = runtime.load_container("default", &id).await.unwrap();
        assert_eq!(record.label(labels::RESTART_STATUS), Some("stopped"));
        assert_eq!(record.label(labels::RESTART_EXPLICITLY_STOPPED), Some("true"));

        manager.restart("svc", None).await.unwrap();
        let record = runtime.load_container("default", &id).await.unwrap();
        assert_eq!(record.label(labels::RESTART_STATUS), Some("running"));
        assert_eq!(record.label(labels::RESTART_EXPLICITLY_STOPPED), None);
        manager.stop("svc", Some(Duration::from_secs(1))).await.unwrap();
    }
}
