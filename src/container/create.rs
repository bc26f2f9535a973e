//! `create`: everything up to a runtime container without a task

use super::config::{parse_extra_host, CreateOptions};
use super::{json_list, labels, new_id, ContainerManager};
use crate::cleanup::UndoStack;
use crate::error::{CtlError, ObjectKind, Result};
use crate::image::ImageConfig;
use crate::logging::{logger_uri, LogConfig, LogDriver};
use crate::network::{parse_publish, resolv_conf, NetworkMode, PortMapping};
use crate::reference::image::ImageRef;
use crate::runtime::{ContainerRecord, ImageRecord, Platform, DEFAULT_OCI_RUNTIME};
use crate::signals::parse_signal;
use crate::spec::{self, HookCommand, NetworkSetup, RootfsView, SpecOptions};
use crate::store::{ContainerDir, HostsMeta, VolumeStore};
use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";
const HOST_HOSTS: &str = "/etc/hosts";

/// `<image basename>-<5 hex digits>`
fn generate_name(image: &str) -> String {
    let base = ImageRef::parse(image)
        .map(|r| r.basename().to_string())
        .unwrap_or_else(|_| "container".to_string());
    let base: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "_.-".contains(c) { c } else { '-' })
        .collect();
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100000);
    format!("{}-{:05x}", base, suffix)
}

/// Network mode plus what the mode needs from other containers
struct NetworkPlan {
    mode: NetworkMode,
    ports: Vec<PortMapping>,
    /// ID and pid of the container whose namespace is joined
    target: Option<(String, u32)>,
}

impl ContainerManager {
    /// Create a container; returns the runtime record
    ///
    /// Every step registers its undo, so a failure anywhere leaves no
    /// container, name, snapshot, volume or endpoint behind.
    pub async fn create(&self, opts: &CreateOptions) -> Result<ContainerRecord> {
        opts.validate()?;
        let _op = self.router.track(format!("create {}", opts.image));
        let cancel = self.cancel_token();

        let platform = match &opts.platform {
            Some(p) => Platform::parse(p)?,
            None => Platform::host(),
        };
        let image = self
            .images
            .ensure(&opts.image, opts.pull, &platform, &cancel)
            .await?;
        let image_config = self.images.config(&image, &platform).await?;

        let id = new_id();
        let mut undo = UndoStack::new();
        let result = self
            .create_steps(&id, opts, &image, &image_config, &platform, &mut undo)
            .await;
        let record = undo.settle(result).await?;
        info!("created {} ({})", Self::name_of(&record), record.id);
        Ok(record)
    }

    async fn create_steps(
        &self,
        id: &str,
        opts: &CreateOptions,
        image: &ImageRecord,
        image_config: &ImageConfig,
        platform: &Platform,
        undo: &mut UndoStack,
    ) -> Result<ContainerRecord> {
        let ns = self.ns().to_string();

        let name = match &opts.name {
            Some(name) => name.clone(),
            None => generate_name(&image.name),
        };
        let names = self.store.names();
        names.reserve(ObjectKind::Container, &name, id)?;
        {
            let (names, name, id) = (names.clone(), name.clone(), id.to_string());
            undo.push("name binding", move || {
                async move { names.release(ObjectKind::Container, &name, &id) }.boxed()
            });
        }

        let dir = self.store.container(id);
        dir.create()?;
        {
            let dir = dir.clone();
            undo.push("state directory", move || async move { dir.remove() }.boxed());
        }

        let plan = self.plan_network(opts).await?;

        let snapshotter = self.cfg.snapshotter.clone();
        let rootfs_mounts = self
            .runtime
            .prepare_snapshot(&ns, &snapshotter, id, &image.name)
            .await?;
        {
            let (runtime, ns, snapshotter, key) =
                (self.runtime.clone(), ns.clone(), snapshotter.clone(), id.to_string());
            undo.push("snapshot", move || {
                async move {
                    match runtime.remove_snapshot(&ns, &snapshotter, &key).await {
                        Err(e) if e.is_not_found() => Ok(()),
                        other => other,
                    }
                }
                .boxed()
            });
        }
        let rootfs = RootfsView::from_mounts(&rootfs_mounts);

        let cwd = std::env::current_dir()?;
        let volumes = self.store.volumes();
        let resolved = spec::mounts::resolve(&opts.mounts, &image_config.volumes, &volumes, &cwd)?;
        {
            let volumes = volumes.clone();
            let mut owned = resolved.anonymous.clone();
            owned.extend(resolved.created.iter().cloned());
            undo.push("volumes", move || {
                async move {
                    remove_volumes(&volumes, &owned);
                    Ok(())
                }
                .boxed()
            });
        }

        let hostname = spec::hostname_for(id, opts.hostname.as_deref(), &plan.mode);
        let extra_hosts = opts
            .add_hosts
            .iter()
            .map(|h| parse_extra_host(h))
            .collect::<Result<Vec<_>>>()?;
        let setup = self.network_files(
            &dir,
            &name,
            hostname.as_deref(),
            &plan,
            &extra_hosts,
            opts,
            undo,
        )?;

        if let NetworkMode::Named(networks) = &plan.mode {
            self.network.allocate(&dir, networks, &plan.ports)?;
            let (network, dir) = (self.network.clone(), dir.clone());
            undo.push("network endpoints", move || {
                async move { network.release(&dir) }.boxed()
            });
        }

        let mut log_config = LogConfig::parse(opts.log_driver.as_deref(), &opts.log_opts)?;
        log_config.name = name.clone();
        log_config.image = opts.image.clone();
        log_config.save(&dir)?;

        let stop_signal = opts
            .stop_signal
            .clone()
            .or_else(|| image_config.stop_signal.clone())
            .unwrap_or_else(|| "SIGTERM".to_string());
        parse_signal(&stop_signal)?;
        dir.set_stop_signal(&stop_signal)?;
        dir.set_restart_policy(&opts.restart.to_string())?;

        let spec = spec::assemble(&SpecOptions {
            id: id.to_string(),
            namespace: ns.clone(),
            image: image_config.clone(),
            rootfs,
            entrypoint: opts.entrypoint.clone(),
            args: opts.args.clone(),
            env: opts.env.clone(),
            env_files: opts.env_files.clone(),
            workdir: opts.workdir.clone(),
            user: opts.user.clone(),
            group_add: opts.group_add.clone(),
            tty: opts.tty,
            hostname: opts.hostname.clone(),
            domainname: opts.domainname.clone(),
            read_only: opts.read_only,
            shm_size: opts.shm_size.clone(),
            mounts: resolved.mounts.clone(),
            network: setup,
            resources: opts.resources.clone(),
            security: opts.security.clone(),
            cgroup_manager: Some(self.cfg.cgroup_manager),
            hook: Some(HookCommand {
                path: self.exe.clone(),
                args: self.cfg.child_args(),
            }),
            annotations: BTreeMap::new(),
            host_cpus: num_cpus::get(),
        })?;

        let mut record_labels = opts.labels.clone();
        record_labels.insert(labels::NAME.into(), name.clone());
        record_labels.insert(labels::HOSTNAME.into(), hostname.unwrap_or_default());
        record_labels.insert(labels::NETWORKS.into(), network_label(&plan.mode)?);
        record_labels.insert(labels::PORTS.into(), serde_json::to_string(&plan.ports)?);
        record_labels.insert(
            labels::ANON_VOLUMES.into(),
            serde_json::to_string(&resolved.anonymous)?,
        );
        record_labels.insert(labels::MOUNTS.into(), serde_json::to_string(&resolved.mounts)?);
        record_labels.insert(labels::STATE_DIR.into(), dir.path().display().to_string());
        record_labels.insert(labels::PLATFORM.into(), platform.to_string());
        record_labels.insert(labels::IMAGE_REF.into(), opts.image.clone());
        record_labels.insert(
            labels::EXTRA_HOSTS.into(),
            serde_json::to_string(&opts.add_hosts)?,
        );
        if log_config.driver != LogDriver::None {
            record_labels.insert(
                labels::LOG_URI.into(),
                logger_uri(&self.exe, &self.cfg.data_root),
            );
        }
        if opts.rm {
            record_labels.insert(labels::AUTO_REMOVE.into(), "true".into());
        }
        if let Some(timeout) = opts.stop_timeout {
            record_labels.insert(labels::STOP_TIMEOUT.into(), timeout.to_string());
        }
        if let Some(user) = &opts.user {
            record_labels.insert(labels::USER.into(), user.clone());
        }
        if opts.restart != super::RestartPolicy::No {
            record_labels.insert(labels::RESTART_POLICY.into(), opts.restart.to_string());
            record_labels.insert(labels::RESTART_STATUS.into(), "running".into());
        }

        if self.cancel_token().is_cancelled() {
            return Err(CtlError::Canceled { user: true });
        }
        let record = self
            .runtime
            .create_container(
                &ns,
                ContainerRecord {
                    id: id.to_string(),
                    image: image.name.clone(),
                    labels: record_labels,
                    spec,
                    snapshotter,
                    snapshot_key: id.to_string(),
                    runtime: DEFAULT_OCI_RUNTIME.to_string(),
                    created_at: Utc::now(),
                },
            )
            .await?;
        {
            let (runtime, ns, id) = (self.runtime.clone(), ns.clone(), id.to_string());
            undo.push("runtime container", move || {
                async move { runtime.delete_container(&ns, &id).await }.boxed()
            });
        }
        debug!("runtime accepted container {}", id);
        Ok(record)
    }

    async fn plan_network(&self, opts: &CreateOptions) -> Result<NetworkPlan> {
        let mode = NetworkMode::parse(&opts.networks)?;
        let mut ports = Vec::new();
        for value in &opts.publish {
            ports.extend(parse_publish(value)?);
        }
        if !ports.is_empty() && !matches!(mode, NetworkMode::Named(_)) {
            return Err(CtlError::usage(format!(
                "port publishing is not supported with --net={}",
                mode
            )));
        }

        let mut target = None;
        match &mode {
            NetworkMode::Container(query) => {
                let record = self.resolve(query).await?;
                let state = self.state(&record).await?;
                if state.status != super::ContainerStatus::Running {
                    return Err(CtlError::NotRunning { id: record.id });
                }
                target = Some((record.id, state.pid));
            }
            NetworkMode::Named(networks) => {
                for network in networks {
                    self.network.resolve(network)?;
                }
            }
            NetworkMode::None | NetworkMode::Host => {}
        }
        Ok(NetworkPlan {
            mode,
            ports,
            target,
        })
    }

    /// Hostname, resolv.conf and hosts files for the container
    #[allow(clippy::too_many_arguments)]
    fn network_files(
        &self,
        dir: &ContainerDir,
        name: &str,
        hostname: Option<&str>,
        plan: &NetworkPlan,
        extra_hosts: &[(String, String)],
        opts: &CreateOptions,
        undo: &mut UndoStack,
    ) -> Result<NetworkSetup> {
        let mut setup = NetworkSetup {
            mode: plan.mode.clone(),
            ..Default::default()
        };
        match &plan.mode {
            NetworkMode::Host => {
                setup.hosts = Some(PathBuf::from(HOST_HOSTS));
                setup.resolv_conf = Some(PathBuf::from(HOST_RESOLV_CONF));
                return Ok(setup);
            }
            NetworkMode::Container(_) => {
                if let Some((target_id, pid)) = &plan.target {
                    let target_dir = self.store.container(target_id);
                    setup.join_netns = Some(PathBuf::from(format!("/proc/{}/ns/net", pid)));
                    setup.hosts = Some(self.store.hosts().hosts_path(target_id));
                    setup.resolv_conf = Some(target_dir.resolv_conf_path());
                    setup.hostname_file = Some(target_dir.hostname_path());
                }
                return Ok(setup);
            }
            NetworkMode::None | NetworkMode::Named(_) => {}
        }

        if let Some(hostname) = hostname {
            std::fs::write(dir.hostname_path(), format!("{}\n", hostname))?;
            setup.hostname_file = Some(dir.hostname_path());
        }

        let host_conf = std::fs::read_to_string(HOST_RESOLV_CONF).unwrap_or_default();
        std::fs::write(
            dir.resolv_conf_path(),
            resolv_conf(&host_conf, &opts.dns, &opts.dns_search, &opts.dns_options),
        )?;
        setup.resolv_conf = Some(dir.resolv_conf_path());

        let hosts = self.store.hosts();
        let path = hosts.prepare(&HostsMeta {
            id: dir.id().to_string(),
            name: name.to_string(),
            hostname: hostname.unwrap_or(name).to_string(),
            networks: plan.mode.networks().to_vec(),
            addresses: Vec::new(),
            extra_hosts: extra_hosts.to_vec(),
        })?;
        {
            let (hosts, id) = (hosts.clone(), dir.id().to_string());
            undo.push("hosts file", move || async move { hosts.remove(&id) }.boxed());
        }
        setup.hosts = Some(path);
        Ok(setup)
    }
}

/// JSON list of network names, or the single special mode
fn network_label(mode: &NetworkMode) -> Result<String> {
    let list = match mode {
        NetworkMode::Named(names) => names.clone(),
        other => vec![other.to_string()],
    };
    Ok(serde_json::to_string(&list)?)
}

/// Remove each volume; a failure is logged and the rest are still removed
fn remove_volumes(volumes: &VolumeStore, names: &[String]) {
    for name in names {
        if let Err(e) = volumes.remove(name) {
            warn!("failed to remove volume {}: {}", name, e);
        }
    }
}

/// Networks recorded on a container
pub(crate) fn recorded_networks(record: &ContainerRecord) -> Vec<String> {
    json_list(record, labels::NETWORKS)
}
