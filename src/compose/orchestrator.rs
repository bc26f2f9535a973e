//! Compose project orchestration
//!
//! A project is the set of containers, networks and volumes carrying its
//! `com.docker.compose.project` label. Every verb turns the compose file into
//! a batch of named operations (`network:<key>`, `volume:<key>`,
//! `service:<name>`) and runs it through the [`Sequencer`], so services come
//! up after what they depend on and go down before it. A failing service
//! skips its dependents while unrelated services carry on; all failures are
//! reported together at the end.

use super::config::{
    BuildConfig, CommandConfig, ComposeConfig, EnvironmentConfig, ServiceConfig, VolumeMount,
};
use crate::container::labels;
use crate::container::ps::PsFilter;
use crate::container::{
    new_id, ContainerManager, ContainerSummary, CreateOptions, ExecRequestOptions, RemoveOptions,
    RestartPolicy,
};
use crate::error::{CtlError, ObjectKind, Result};
use crate::image::PullPolicy;
use crate::logging::reader::{parse_duration, read_json_file, render};
use crate::logging::{LogConfig, LogDriver, LogEntry, LogsOptions};
use crate::network::NetworkCreate;
use crate::runtime::build::BuildOptions;
use crate::runtime::{ContainerRecord, Platform};
use crate::sequencer::Sequencer;
use crate::signals::{SIGHUP, SIGINT, SIGTERM};
use crate::task::LocalStdio;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Flags of `compose up` and `compose create`
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    /// Services to bring up, with their dependencies; empty means all
    pub services: Vec<String>,
    pub detach: bool,
    /// Rebuild images of services that have a build section
    pub build: bool,
    /// Overrides every service's `pull_policy`
    pub pull: Option<PullPolicy>,
}

/// Flags of `compose down`
#[derive(Debug, Clone, Copy, Default)]
pub struct DownOptions {
    /// Also remove named volumes declared by the project
    pub volumes: bool,
    /// Remove containers of services no longer in the file
    pub remove_orphans: bool,
    pub timeout: Option<Duration>,
}

/// Flags of `compose run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub service: String,
    /// Replaces the service command when not empty
    pub args: Vec<String>,
    pub name: Option<String>,
    pub entrypoint: Option<String>,
    pub env: Vec<String>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub detach: bool,
    pub rm: bool,
    pub tty: bool,
    pub interactive: bool,
    /// Do not start the services this one depends on
    pub no_deps: bool,
    /// Publish the service's ports, which one-off containers skip by default
    pub service_ports: bool,
}

/// Multi-container application described by one compose file
#[derive(Clone)]
pub struct ComposeOrchestrator {
    project: String,
    config: Arc<ComposeConfig>,
    manager: ContainerManager,
    working_dir: PathBuf,
}

/// Split a compose `command` string into words, honouring quotes
fn shell_words(input: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => match chars.next() {
                Some(next) => current.push(next),
                None => current.push('\\'),
            },
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err(CtlError::InvalidConfig(format!(
            "unterminated quote in {:?}",
            input
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn command_words(command: &CommandConfig) -> Result<Vec<String>> {
    match command {
        CommandConfig::Shell(line) => shell_words(line),
        CommandConfig::Exec(words) => Ok(words.clone()),
    }
}

/// Compose `pull_policy`; `build` asks for a rebuild instead of a pull
fn pull_policy(value: Option<&str>) -> Result<(PullPolicy, bool)> {
    match value {
        None | Some("missing") | Some("if_not_present") => Ok((PullPolicy::Missing, false)),
        Some("build") => Ok((PullPolicy::Missing, true)),
        Some(other) => Ok((other.parse()?, false)),
    }
}

fn service_op(name: &str) -> String {
    format!("service:{}", name)
}

fn network_op(key: &str) -> String {
    format!("network:{}", key)
}

fn volume_op(key: &str) -> String {
    format!("volume:{}", key)
}

fn container_number(record: &ContainerRecord) -> u32 {
    record
        .label(labels::COMPOSE_NUMBER)
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn is_oneoff(record: &ContainerRecord) -> bool {
    record
        .label(labels::COMPOSE_ONEOFF)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl ComposeOrchestrator {
    pub fn new(
        project: impl Into<String>,
        config: ComposeConfig,
        manager: ContainerManager,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            project: project.into(),
            config: Arc::new(config),
            manager,
            working_dir,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    fn service(&self, name: &str) -> Result<&ServiceConfig> {
        self.config
            .services
            .get(name)
            .ok_or_else(|| CtlError::usage(format!("no such service: {}", name)))
    }

    /// Runtime name of the network declared under `key`
    pub fn network_name(&self, key: &str) -> String {
        match self.config.networks.get(key).and_then(Option::as_ref) {
            Some(network) => match (&network.name, network.external) {
                (Some(name), _) => name.clone(),
                (None, Some(true)) => key.to_string(),
                _ => format!("{}_{}", self.project, key),
            },
            None => format!("{}_{}", self.project, key),
        }
    }

    fn network_external(&self, key: &str) -> bool {
        self.config
            .networks
            .get(key)
            .and_then(Option::as_ref)
            .and_then(|n| n.external)
            .unwrap_or(false)
    }

    /// Runtime name of the volume declared under `key`
    pub fn volume_name(&self, key: &str) -> String {
        match self.config.volumes.get(key).and_then(Option::as_ref) {
            Some(volume) => match (&volume.name, volume.external) {
                (Some(name), _) => name.clone(),
                (None, Some(true)) => key.to_string(),
                _ => format!("{}_{}", self.project, key),
            },
            None => format!("{}_{}", self.project, key),
        }
    }

    fn volume_external(&self, key: &str) -> bool {
        self.config
            .volumes
            .get(key)
            .and_then(Option::as_ref)
            .and_then(|v| v.external)
            .unwrap_or(false)
    }

    /// `<project>-<service>-<n>` unless the service pins `container_name`
    pub fn container_name(&self, service: &str, number: u32) -> String {
        match self
            .config
            .services
            .get(service)
            .and_then(|s| s.container_name.clone())
        {
            Some(name) => name,
            None => format!("{}-{}-{}", self.project, service, number),
        }
    }

    fn image_name(&self, service: &str, config: &ServiceConfig) -> String {
        config
            .image
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.project, service))
    }

    /// `requested` plus, with `with_deps`, everything they depend on
    fn selected(&self, requested: &[String], with_deps: bool) -> Result<BTreeSet<String>> {
        if requested.is_empty() {
            return Ok(self.config.services.keys().cloned().collect());
        }
        let mut selected = BTreeSet::new();
        let mut queue: Vec<String> = requested.to_vec();
        while let Some(name) = queue.pop() {
            let service = self.service(&name)?;
            if selected.insert(name.clone()) && with_deps {
                queue.extend(service.dependencies());
            }
        }
        Ok(selected)
    }

    fn dependents(&self, name: &str) -> Vec<String> {
        self.config
            .services
            .iter()
            .filter(|(_, s)| s.dependencies().iter().any(|d| d == name))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Network keys `service` joins; empty with `network_mode`
    fn service_networks(&self, service: &ServiceConfig) -> Vec<String> {
        if service.network_mode.is_some() {
            return Vec::new();
        }
        service.network_keys()
    }

    /// Declared volume keys `service` mounts
    fn service_volumes(&self, service: &ServiceConfig) -> Vec<String> {
        let mut keys = Vec::new();
        for mount in service.volumes.iter().flatten() {
            let source = match mount {
                VolumeMount::Short(spec) => spec.split_once(':').map(|(s, _)| s.to_string()),
                VolumeMount::Long(long) => long.source.clone(),
            };
            if let Some(source) = source {
                if self.config.volumes.contains_key(&source) && !keys.contains(&source) {
                    keys.push(source);
                }
            }
        }
        keys
    }

    /// Containers of this project, service containers first sorted by
    /// service and number
    pub async fn containers(&self) -> Result<Vec<ContainerRecord>> {
        let ns = self.manager.config().namespace.clone();
        let mut records = Vec::new();
        for record in self.manager.runtime().list_containers(&ns).await? {
            if record.label(labels::COMPOSE_PROJECT) != Some(self.project.as_str()) {
                continue;
            }
            if self.manager.reap_if_orphaned(&record).await? {
                continue;
            }
            records.push(record);
        }
        records.sort_by(|a, b| {
            (is_oneoff(a), a.label(labels::COMPOSE_SERVICE), container_number(a)).cmp(&(
                is_oneoff(b),
                b.label(labels::COMPOSE_SERVICE),
                container_number(b),
            ))
        });
        Ok(records)
    }

    async fn service_containers(&self, service: &str, oneoff: bool) -> Result<Vec<ContainerRecord>> {
        Ok(self
            .containers()
            .await?
            .into_iter()
            .filter(|r| r.label(labels::COMPOSE_SERVICE) == Some(service))
            .filter(|r| oneoff || !is_oneoff(r))
            .collect())
    }

    fn host_path(&self, source: &str) -> String {
        if let Some(rest) = source.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest).to_string_lossy().into_owned();
            }
        }
        if Path::new(source).is_absolute() {
            return source.to_string();
        }
        let relative = source.strip_prefix("./").unwrap_or(source);
        self.working_dir
            .join(relative)
            .to_string_lossy()
            .into_owned()
    }

    fn is_host_path(source: &str) -> bool {
        source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
    }

    /// Map a short `volumes:` entry onto `-v` syntax
    fn volume_spec(&self, spec: &str) -> String {
        match spec.split_once(':') {
            None => spec.to_string(),
            Some((source, rest)) if Self::is_host_path(source) => {
                format!("{}:{}", self.host_path(source), rest)
            }
            Some((source, rest)) if self.config.volumes.contains_key(source) => {
                format!("{}:{}", self.volume_name(source), rest)
            }
            Some(_) => spec.to_string(),
        }
    }

    /// Fill `opts.mounts` from the service's `volumes` and `tmpfs`
    fn apply_mounts(&self, service: &ServiceConfig, opts: &mut CreateOptions) {
        for mount in service.volumes.iter().flatten() {
            match mount {
                VolumeMount::Short(spec) => opts.mounts.volumes.push(self.volume_spec(spec)),
                VolumeMount::Long(long) => {
                    let kind = long.mount_type.as_deref().unwrap_or("volume");
                    match (kind, long.source.as_deref()) {
                        ("tmpfs", _) => opts.mounts.tmpfs.push(long.target.clone()),
                        ("volume", None) => opts.mounts.volumes.push(long.target.clone()),
                        (kind, Some(source)) => {
                            let source = match kind {
                                "bind" => self.host_path(source),
                                _ if self.config.volumes.contains_key(source) => {
                                    self.volume_name(source)
                                }
                                _ => source.to_string(),
                            };
                            let mut spec =
                                format!("type={},source={},target={}", kind, source, long.target);
                            if long.read_only.unwrap_or(false) {
                                spec.push_str(",readonly");
                            }
                            opts.mounts.mounts.push(spec);
                        }
                        (kind, None) => {
                            opts.mounts
                                .mounts
                                .push(format!("type={},target={}", kind, long.target));
                        }
                    }
                }
            }
        }
        if let Some(tmpfs) = &service.tmpfs {
            opts.mounts.tmpfs.extend(tmpfs.to_vec());
        }
    }

    /// Create options for replica `number` of `name`
    fn service_options(
        &self,
        name: &str,
        service: &ServiceConfig,
        image: &str,
        number: u32,
    ) -> Result<CreateOptions> {
        let mut opts = CreateOptions::new(image, Vec::new());
        opts.name = Some(self.container_name(name, number));
        opts.detach = true;

        if let Some(command) = &service.command {
            opts.args = command_words(command)?;
        }
        if let Some(entrypoint) = &service.entrypoint {
            let mut words = command_words(entrypoint)?;
            if !words.is_empty() {
                opts.entrypoint = Some(words.remove(0));
                words.append(&mut opts.args);
                opts.args = words;
            }
        }

        match &service.environment {
            Some(EnvironmentConfig::Array(list)) => opts.env = list.clone(),
            Some(EnvironmentConfig::Map(map)) => {
                opts.env = map
                    .iter()
                    .map(|(k, v)| match v {
                        Some(v) => format!("{}={}", k, v),
                        None => k.clone(),
                    })
                    .collect()
            }
            None => {}
        }
        if let Some(files) = &service.env_file {
            opts.env_files = files
                .to_vec()
                .iter()
                .map(|f| PathBuf::from(self.host_path(f)))
                .collect();
        }
        opts.hostname = service.hostname.clone();
        opts.workdir = service.working_dir.clone();
        opts.user = service.user.clone();

        opts.publish = service
            .ports
            .iter()
            .flatten()
            .map(|p| p.to_publish())
            .collect();
        self.apply_mounts(service, &mut opts);

        opts.networks = match service.network_mode.as_deref() {
            Some(mode) => match mode.strip_prefix("service:") {
                Some(other) => vec![format!("container:{}", self.container_name(other, 1))],
                None => vec![mode.to_string()],
            },
            None => service
                .network_keys()
                .iter()
                .map(|key| self.network_name(key))
                .collect(),
        };
        opts.dns = service.dns.as_ref().map(|d| d.to_vec()).unwrap_or_default();
        opts.dns_search = service
            .dns_search
            .as_ref()
            .map(|d| d.to_vec())
            .unwrap_or_default();
        opts.add_hosts = service
            .extra_hosts
            .iter()
            .flatten()
            .map(|h| h.replacen('=', ":", 1))
            .collect();

        if let Some(user_labels) = &service.labels {
            opts.labels = user_labels.to_map();
        }
        opts.labels
            .insert(labels::COMPOSE_PROJECT.to_string(), self.project.clone());
        opts.labels
            .insert(labels::COMPOSE_SERVICE.to_string(), name.to_string());
        opts.labels
            .insert(labels::COMPOSE_NUMBER.to_string(), number.to_string());
        opts.labels
            .insert(labels::COMPOSE_ONEOFF.to_string(), "False".to_string());

        if let Some(logging) = &service.logging {
            opts.log_driver = logging.driver.clone();
            opts.log_opts = logging
                .options
                .iter()
                .flatten()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
        }
        if let Some(restart) = &service.restart {
            opts.restart = restart.parse()?;
        }
        opts.stop_signal = service.stop_signal.clone();
        if let Some(grace) = &service.stop_grace_period {
            let duration = parse_duration(grace).ok_or_else(|| {
                CtlError::InvalidConfig(format!("invalid stop_grace_period {:?}", grace))
            })?;
            opts.stop_timeout = Some(duration.num_seconds().max(0) as u64);
        }

        opts.tty = service.tty.unwrap_or(false);
        opts.interactive = service.stdin_open.unwrap_or(false);
        opts.read_only = service.read_only.unwrap_or(false);
        opts.security.privileged = service.privileged.unwrap_or(false);
        opts.security.cap_add = service.cap_add.clone().unwrap_or_default();
        opts.security.cap_drop = service.cap_drop.clone().unwrap_or_default();
        opts.security.security_opt = service.security_opt.clone().unwrap_or_default();
        opts.security.devices = service.devices.clone().unwrap_or_default();
        opts.security.sysctls = service
            .sysctls
            .as_ref()
            .map(|s| {
                s.to_map()
                    .into_iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect()
            })
            .unwrap_or_default();
        opts.resources.cpus = service.cpus;
        opts.resources.memory = service.mem_limit.clone();
        opts.resources.pids_limit = service.pids_limit;
        opts.platform = service.platform.clone();
        Ok(opts)
    }

    async fn build_service(&self, name: &str, service: &ServiceConfig, tag: &str) -> Result<()> {
        let (context, opts) = match &service.build {
            Some(BuildConfig::Simple(context)) => (context.clone(), None),
            Some(BuildConfig::Full(full)) => (
                full.context.clone().unwrap_or_else(|| ".".to_string()),
                Some(full),
            ),
            None => return Ok(()),
        };
        let context = PathBuf::from(self.host_path(&context));
        let mut build = BuildOptions {
            file: opts
                .and_then(|o| o.dockerfile.as_ref())
                .map(|f| context.join(f)),
            context,
            tags: vec![tag.to_string()],
            ..Default::default()
        };
        if let Some(full) = opts {
            build.build_args = full.args.as_ref().map(|a| a.to_map()).unwrap_or_default();
            build.labels = full.labels.as_ref().map(|l| l.to_map()).unwrap_or_default();
            build.target = full.target.clone();
            build.no_cache = full.no_cache.unwrap_or(false);
        }
        if let Some(platform) = &service.platform {
            build.platforms = vec![platform.clone()];
        }
        info!("building image {} for service {}", tag, name);
        self.manager.build(&build).await
    }

    /// Make the service's image available, building or pulling as needed
    async fn ensure_image(
        &self,
        name: &str,
        service: &ServiceConfig,
        build: bool,
        pull: Option<PullPolicy>,
    ) -> Result<String> {
        let image = self.image_name(name, service);
        let (policy, force_build) = pull_policy(service.pull_policy.as_deref())?;
        let policy = pull.unwrap_or(policy);
        let platform = match &service.platform {
            Some(p) => Platform::parse(p)?,
            None => Platform::host(),
        };
        let cancel = self.manager.cancel_token();
        if service.build.is_some() {
            let present = self
                .manager
                .images()
                .ensure(&image, PullPolicy::Never, &platform, &cancel)
                .await;
            match present {
                Ok(_) if !(build || force_build) => {}
                Ok(_) => self.build_service(name, service, &image).await?,
                Err(e) if e.is_not_found() => self.build_service(name, service, &image).await?,
                Err(e) => return Err(e),
            }
            return Ok(image);
        }
        self.manager
            .images()
            .ensure(&image, policy, &platform, &cancel)
            .await?;
        Ok(image)
    }

    async fn ensure_network(&self, key: &str) -> Result<()> {
        let name = self.network_name(key);
        let networks = self.manager.network().networks();
        if networks.get(&name)?.is_some() {
            return Ok(());
        }
        if self.network_external(key) {
            return Err(CtlError::not_found(ObjectKind::Network, name));
        }
        let declared = self
            .config
            .networks
            .get(key)
            .cloned()
            .flatten()
            .unwrap_or_default();
        let mut network_labels = declared
            .labels
            .as_ref()
            .map(|l| l.to_map())
            .unwrap_or_default();
        network_labels.insert(labels::COMPOSE_PROJECT.to_string(), self.project.clone());
        network_labels.insert(labels::COMPOSE_NETWORK.to_string(), key.to_string());
        let pools = declared
            .ipam
            .as_ref()
            .and_then(|i| i.config.clone())
            .unwrap_or_default();
        let first = pools.first();
        let create = NetworkCreate {
            name: name.clone(),
            driver: declared
                .driver
                .as_deref()
                .map(str::parse)
                .transpose()?
                .unwrap_or_default(),
            subnets: pools.iter().filter_map(|p| p.subnet.clone()).collect(),
            gateway: first.and_then(|p| p.gateway.clone()),
            ip_range: first.and_then(|p| p.ip_range.clone()),
            options: declared.driver_opts.clone().unwrap_or_default(),
            labels: network_labels,
        };
        match self.manager.network_create(create) {
            Ok(_) => {
                info!("created network {}", name);
                Ok(())
            }
            // Created concurrently by another command.
            Err(CtlError::NameConflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ensure_volume(&self, key: &str) -> Result<()> {
        let name = self.volume_name(key);
        if self.volume_external(key) {
            return self.manager.store().volumes().get(&name).map(|_| ());
        }
        let declared = self
            .config
            .volumes
            .get(key)
            .cloned()
            .flatten()
            .unwrap_or_default();
        let mut volume_labels = declared
            .labels
            .as_ref()
            .map(|l| l.to_map())
            .unwrap_or_default();
        volume_labels.insert(labels::COMPOSE_PROJECT.to_string(), self.project.clone());
        volume_labels.insert(labels::COMPOSE_VOLUME.to_string(), key.to_string());
        self.manager.volume_create(Some(&name), volume_labels)?;
        debug!("volume {} ready", name);
        Ok(())
    }

    /// Create missing replicas of `name` and, with `start`, start them all
    async fn converge_service(&self, name: &str, up: &UpOptions, start: bool) -> Result<()> {
        let service = self.service(name)?.clone();
        let image = self.ensure_image(name, &service, up.build, up.pull).await?;
        let existing = self.service_containers(name, false).await?;
        for number in 1..=service.replicas() {
            let id = match existing.iter().find(|r| container_number(r) == number) {
                Some(record) => record.id.clone(),
                None => {
                    let opts = self.service_options(name, &service, &image, number)?;
                    let record = self.manager.create(&opts).await?;
                    info!("created container {}", self.container_name(name, number));
                    record.id
                }
            };
            if start {
                self.manager.start(&id, None).await?;
            }
        }
        Ok(())
    }

    /// Batch that brings `services` (and what they need) into existence
    fn converge_batch(&self, services: &BTreeSet<String>, up: &UpOptions, start: bool) -> Result<Sequencer> {
        let mut seq = Sequencer::new(0);
        let mut networks = BTreeSet::new();
        let mut volumes = BTreeSet::new();
        for name in services {
            let service = self.service(name)?;
            networks.extend(self.service_networks(service));
            volumes.extend(self.service_volumes(service));
        }
        for key in networks {
            let this = self.clone();
            seq.add(network_op(&key), Vec::new(), move || {
                async move { this.ensure_network(&key).await }.boxed()
            });
        }
        for key in volumes {
            let this = self.clone();
            seq.add(volume_op(&key), Vec::new(), move || {
                async move { this.ensure_volume(&key).await }.boxed()
            });
        }
        for name in services {
            let service = self.service(name)?;
            let mut after: Vec<String> = service
                .dependencies()
                .iter()
                .filter(|d| services.contains(*d))
                .map(|d| service_op(d))
                .collect();
            after.extend(self.service_networks(service).iter().map(|k| network_op(k)));
            after.extend(self.service_volumes(service).iter().map(|k| volume_op(k)));
            let this = self.clone();
            let name = name.clone();
            let up = up.clone();
            seq.add(service_op(&name), after, move || {
                async move { this.converge_service(&name, &up, start).await }.boxed()
            });
        }
        Ok(seq)
    }

    /// `compose create`
    pub async fn create(&self, opts: &UpOptions) -> Result<()> {
        let services = self.selected(&opts.services, true)?;
        self.converge_batch(&services, opts, false)?
            .run(&self.manager.cancel_token())
            .await?
            .into_result()
    }

    /// `compose up`; attached, the containers' output is followed until
    /// they all exit or the user interrupts, which stops the project
    pub async fn up(&self, opts: &UpOptions, out: &mut (dyn Write + Send)) -> Result<()> {
        let services = self.selected(&opts.services, true)?;
        info!("starting project {}", self.project);
        self.converge_batch(&services, opts, true)?
            .run(&self.manager.cancel_token())
            .await?
            .into_result()?;
        if opts.detach {
            return Ok(());
        }
        let records: Vec<ContainerRecord> = self
            .containers()
            .await?
            .into_iter()
            .filter(|r| !is_oneoff(r))
            .filter(|r| {
                r.label(labels::COMPOSE_SERVICE)
                    .map(|s| services.contains(s))
                    .unwrap_or(false)
            })
            .collect();
        let follow = LogsOptions {
            follow: true,
            ..Default::default()
        };
        if self.follow(&records, &follow, out).await? {
            info!("stopping project {}", self.project);
            let names: Vec<String> = services.into_iter().collect();
            self.stop(&names, None).await?;
            return Err(CtlError::Canceled { user: true });
        }
        Ok(())
    }

    /// `compose down`: containers in reverse dependency order, then the
    /// project's networks and, with `volumes`, its named volumes
    pub async fn down(&self, opts: &DownOptions) -> Result<()> {
        let mut seq = Sequencer::new(0);
        let containers = self.containers().await?;
        let mut service_ops = Vec::new();
        for name in self.config.services.keys() {
            let after = self
                .dependents(name)
                .iter()
                .map(|d| service_op(d))
                .collect();
            let records: Vec<ContainerRecord> = containers
                .iter()
                .filter(|r| r.label(labels::COMPOSE_SERVICE) == Some(name.as_str()))
                .cloned()
                .collect();
            let this = self.clone();
            let timeout = opts.timeout;
            service_ops.push(service_op(name));
            seq.add(service_op(name), after, move || {
                async move { this.remove_containers(records, timeout).await }.boxed()
            });
        }

        let orphans: Vec<ContainerRecord> = containers
            .iter()
            .filter(|r| {
                r.label(labels::COMPOSE_SERVICE)
                    .map(|s| !self.config.services.contains_key(s))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !orphans.is_empty() {
            if opts.remove_orphans {
                let this = self.clone();
                let timeout = opts.timeout;
                service_ops.push("orphans".to_string());
                seq.add("orphans", Vec::new(), move || {
                    async move { this.remove_containers(orphans, timeout).await }.boxed()
                });
            } else {
                let names: Vec<String> = orphans.iter().map(ContainerManager::name_of).collect();
                warn!(
                    "found orphan containers ({}) for this project, use --remove-orphans to clean them up",
                    names.join(", ")
                );
            }
        }

        let mut networks: BTreeSet<String> = self.config.networks.keys().cloned().collect();
        for service in self.config.services.values() {
            networks.extend(self.service_networks(service));
        }
        for key in networks {
            if self.network_external(&key) {
                continue;
            }
            let this = self.clone();
            seq.add(network_op(&key), service_ops.clone(), move || {
                async move { this.remove_network(&key) }.boxed()
            });
        }
        if opts.volumes {
            for key in self.config.volumes.keys() {
                if self.volume_external(key) {
                    continue;
                }
                let this = self.clone();
                let key = key.clone();
                seq.add(volume_op(&key), service_ops.clone(), move || {
                    async move {
                        let name = this.volume_name(&key);
                        match this.manager.volume_rm(&[name], false).await {
                            Err(e) if e.is_not_found() => Ok(()),
                            other => other.map(|_| ()),
                        }
                    }
                    .boxed()
                });
            }
        }
        seq.run(&self.manager.cancel_token()).await?.into_result()
    }

    async fn remove_containers(&self, records: Vec<ContainerRecord>, timeout: Option<Duration>) -> Result<()> {
        for record in records {
            let name = ContainerManager::name_of(&record);
            if self.manager.state(&record).await?.is_running() {
                self.manager.stop(&record.id, timeout).await?;
            }
            let remove = RemoveOptions {
                force: true,
                volumes: true,
            };
            self.manager.rm(&[record.id.clone()], &remove).await?;
            info!("removed container {}", name);
        }
        Ok(())
    }

    fn remove_network(&self, key: &str) -> Result<()> {
        let name = self.network_name(key);
        if self.manager.network().networks().get(&name)?.is_none() {
            return Ok(());
        }
        self.manager.network_rm(&[name]).map(|_| ())
    }

    /// Run `action` on the containers of `services`, dependencies first or,
    /// with `reverse`, dependents first
    async fn for_services<F>(&self, services: &[String], reverse: bool, action: F) -> Result<()>
    where
        F: Fn(ContainerManager, String) -> futures::future::BoxFuture<'static, Result<()>>
            + Send
            + Sync
            + Clone
            + 'static,
    {
        let selected = self.selected(services, false)?;
        let containers = self.containers().await?;
        let mut seq = Sequencer::new(0);
        for name in &selected {
            let related = if reverse {
                self.dependents(name)
            } else {
                self.service(name)?.dependencies()
            };
            let after = related
                .iter()
                .filter(|n| selected.contains(*n))
                .map(|n| service_op(n))
                .collect();
            let ids: Vec<String> = containers
                .iter()
                .filter(|r| !is_oneoff(r))
                .filter(|r| r.label(labels::COMPOSE_SERVICE) == Some(name.as_str()))
                .map(|r| r.id.clone())
                .collect();
            let manager = self.manager.clone();
            let action = action.clone();
            seq.add(service_op(name), after, move || {
                async move {
                    for id in ids {
                        action(manager.clone(), id).await?;
                    }
                    Ok(())
                }
                .boxed()
            });
        }
        seq.run(&self.manager.cancel_token()).await?.into_result()
    }

    /// `compose start`: existing containers only
    pub async fn start(&self, services: &[String]) -> Result<()> {
        for name in self.selected(services, false)? {
            if self.service_containers(&name, false).await?.is_empty() {
                return Err(CtlError::usage(format!(
                    "service {} has no container to start, use compose up",
                    name
                )));
            }
        }
        self.for_services(services, false, |manager, id| {
            async move { manager.start(&id, None).await.map(|_| ()) }.boxed()
        })
        .await
    }

    /// `compose stop`
    pub async fn stop(&self, services: &[String], timeout: Option<Duration>) -> Result<()> {
        self.for_services(services, true, move |manager, id| {
            async move {
                let record = manager.resolve(&id).await?;
                if manager.state(&record).await?.is_running() {
                    manager.stop(&id, timeout).await?;
                }
                Ok(())
            }
            .boxed()
        })
        .await
    }

    /// `compose restart`
    pub async fn restart(&self, services: &[String], timeout: Option<Duration>) -> Result<()> {
        self.for_services(services, false, move |manager, id| {
            async move { manager.restart(&id, timeout).await.map(|_| ()) }.boxed()
        })
        .await
    }

    /// `compose ps`
    pub async fn ps(&self, all: bool, services: &[String]) -> Result<Vec<ContainerSummary>> {
        let filter = PsFilter {
            label: vec![(
                labels::COMPOSE_PROJECT.to_string(),
                Some(self.project.clone()),
            )],
            ..Default::default()
        };
        let mut rows: Vec<ContainerSummary> = self
            .manager
            .ps(all, &filter)
            .await?
            .into_iter()
            .filter(|row| {
                services.is_empty()
                    || row
                        .labels
                        .get(labels::COMPOSE_SERVICE)
                        .map(|s| services.contains(s))
                        .unwrap_or(false)
            })
            .collect();
        rows.sort_by(|a, b| a.names.cmp(&b.names));
        Ok(rows)
    }

    /// `compose run`: a one-off container of `service`
    pub async fn run(&self, opts: &RunOptions, local: LocalStdio) -> Result<String> {
        let service = self.service(&opts.service)?.clone();
        if !opts.no_deps {
            let deps = service.dependencies();
            if !deps.is_empty() {
                let services = self.selected(&deps, true)?;
                self.converge_batch(&services, &UpOptions::default(), true)?
                    .run(&self.manager.cancel_token())
                    .await?
                    .into_result()?;
            }
        }
        let mut prereq = Sequencer::new(0);
        for key in self.service_networks(&service) {
            let this = self.clone();
            prereq.add(network_op(&key), Vec::new(), move || {
                async move { this.ensure_network(&key).await }.boxed()
            });
        }
        for key in self.service_volumes(&service) {
            let this = self.clone();
            prereq.add(volume_op(&key), Vec::new(), move || {
                async move { this.ensure_volume(&key).await }.boxed()
            });
        }
        prereq
            .run(&self.manager.cancel_token())
            .await?
            .into_result()?;

        let image = self.ensure_image(&opts.service, &service, false, None).await?;
        let mut create = self.service_options(&opts.service, &service, &image, 1)?;
        let suffix: String = new_id().chars().take(12).collect();
        create.name = Some(
            opts.name
                .clone()
                .unwrap_or_else(|| format!("{}-{}-run-{}", self.project, opts.service, suffix)),
        );
        create
            .labels
            .insert(labels::COMPOSE_ONEOFF.to_string(), "True".to_string());
        if !opts.args.is_empty() {
            create.args = opts.args.clone();
        }
        if let Some(entrypoint) = &opts.entrypoint {
            create.entrypoint = Some(entrypoint.clone());
        }
        create.env.extend(opts.env.iter().cloned());
        if opts.user.is_some() {
            create.user = opts.user.clone();
        }
        if opts.workdir.is_some() {
            create.workdir = opts.workdir.clone();
        }
        if !opts.service_ports {
            create.publish.clear();
        }
        create.restart = RestartPolicy::No;
        create.detach = opts.detach;
        create.rm = opts.rm;
        create.tty = opts.tty;
        create.interactive = opts.interactive;
        self.manager.run(&create, local).await
    }

    /// `compose exec SERVICE`; `index` picks the replica
    pub async fn exec(
        &self,
        service: &str,
        index: u32,
        opts: &ExecRequestOptions,
        local: LocalStdio,
    ) -> Result<()> {
        self.service(service)?;
        let record = self
            .service_containers(service, false)
            .await?
            .into_iter()
            .find(|r| container_number(r) == index)
            .ok_or_else(|| {
                CtlError::not_found(ObjectKind::Container, self.container_name(service, index))
            })?;
        self.manager.exec(&record.id, opts, local).await
    }

    /// `compose logs`; every line is prefixed with its container name
    pub async fn logs(
        &self,
        services: &[String],
        opts: &LogsOptions,
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        let selected = self.selected(services, false)?;
        let records: Vec<ContainerRecord> = self
            .containers()
            .await?
            .into_iter()
            .filter(|r| {
                r.label(labels::COMPOSE_SERVICE)
                    .map(|s| selected.contains(s))
                    .unwrap_or(false)
            })
            .collect();
        if opts.follow {
            self.follow(&records, opts, out).await?;
            return Ok(());
        }
        let width = prefix_width(&records);
        for record in &records {
            let dir = self.manager.store().container(&record.id);
            if LogConfig::load(&dir)?.driver != LogDriver::JsonFile {
                continue;
            }
            let name = ContainerManager::name_of(record);
            let stop = self.manager.cancel_token().child_token();
            read_json_file(&dir.log_path(), opts, &stop, |entry| {
                write_prefixed(&mut *out, &name, width, entry, opts.timestamps)
            })
            .await?;
        }
        out.flush()?;
        Ok(())
    }

    /// Merge the json-file logs of `records` into `out` until every
    /// container exits; `true` when an interrupt ended it early
    async fn follow(
        &self,
        records: &[ContainerRecord],
        opts: &LogsOptions,
        out: &mut (dyn Write + Send),
    ) -> Result<bool> {
        let width = prefix_width(records);
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, LogEntry)>();
        let mut stops = Vec::new();
        let mut readers = Vec::new();
        for record in records {
            let dir = self.manager.store().container(&record.id);
            let name = ContainerManager::name_of(record);
            if LogConfig::load(&dir)?.driver != LogDriver::JsonFile {
                warn!("{} does not log to json-file, its output is not shown", name);
                continue;
            }
            let (stop, watcher) = self.manager.exit_token(&record.id).await?;
            stops.push(stop.clone());
            let tx = tx.clone();
            let opts = opts.clone();
            let path = dir.log_path();
            readers.push(tokio::spawn(async move {
                let result = read_json_file(&path, &opts, &stop, |entry| {
                    tx.send((name.clone(), entry.clone()))
                        .map_err(|_| CtlError::internal("log output closed"))
                })
                .await;
                if let Some(watcher) = watcher {
                    watcher.abort();
                }
                result
            }));
        }
        drop(tx);

        let mut signals = self.manager.router().forward();
        let interrupted = loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some((name, entry)) => {
                        write_prefixed(&mut *out, &name, width, &entry, opts.timestamps)?;
                        out.flush()?;
                    }
                    None => break false,
                },
                Some(signal) = signals.recv() => {
                    if matches!(signal, SIGINT | SIGTERM | SIGHUP) {
                        break true;
                    }
                }
            }
        };
        for stop in &stops {
            stop.cancel();
        }
        for reader in readers {
            match reader.await {
                Ok(Err(e)) => debug!("log follower ended: {}", e),
                Err(e) => debug!("log follower panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        Ok(interrupted)
    }
}

fn prefix_width(records: &[ContainerRecord]) -> usize {
    records
        .iter()
        .map(|r| ContainerManager::name_of(r).len())
        .max()
        .unwrap_or(0)
}

fn write_prefixed(
    out: &mut (dyn Write + Send),
    name: &str,
    width: usize,
    entry: &LogEntry,
    timestamps: bool,
) -> Result<()> {
    let line = render(entry, timestamps);
    write!(out, "{:<width$} | {}", name, line, width = width)?;
    if !line.ends_with('\n') {
        writeln!(out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeParser;
    use crate::container::tests::{capture, manager};
    use crate::logging::JsonFileWriter;
    use std::collections::HashMap;

    fn project(manager: &ContainerManager, yaml: &str) -> ComposeOrchestrator {
        let config = ComposeParser::parse_str(yaml, &HashMap::new()).unwrap();
        ComposeOrchestrator::new("demo", config, manager.clone(), PathBuf::from("/srv/demo"))
    }

    fn detached() -> UpOptions {
        UpOptions {
            detach: true,
            ..Default::default()
        }
    }

    const STACK: &str = r#"
services:
  web:
    image: alpine
    command: sleep 1h
    depends_on: [db]
    labels:
      tier: front
  db:
    image: alpine
    command: ["sleep", "1h"]
    volumes:
      - data:/var/lib/db
volumes:
  data:
"#;

    #[test]
    fn test_shell_words() {
        assert_eq!(
            shell_words(r#"sh -c "echo 'hi there'" x\ y"#).unwrap(),
            vec!["sh", "-c", "echo 'hi there'", "x y"]
        );
        assert!(shell_words("echo \"open").is_err());
        assert!(shell_words("   ").unwrap().is_empty());
    }

    #[test]
    fn test_pull_policy() {
        assert_eq!(pull_policy(None).unwrap(), (PullPolicy::Missing, false));
        assert_eq!(pull_policy(Some("build")).unwrap(), (PullPolicy::Missing, true));
        assert_eq!(pull_policy(Some("always")).unwrap(), (PullPolicy::Always, false));
        assert!(pull_policy(Some("sometimes")).is_err());
    }

    #[tokio::test]
    async fn test_service_options() {
        let (manager, _runtime, _temp) = manager();
        let yaml = r#"
services:
  app:
    image: alpine
    entrypoint: ["/bin/sh", "-c"]
    command: echo hello
    environment:
      A: "1"
      B:
    volumes:
      - ./conf:/etc/app:ro
      - cache:/cache
      - /logs
    ports:
      - "8080:80"
    restart: on-failure:3
    stop_grace_period: 1m30s
    network_mode: host
volumes:
  cache:
"#;
        let orchestrator = project(&manager, yaml);
        let service = orchestrator.service("app").unwrap().clone();
        let opts = orchestrator
            .service_options("app", &service, "alpine", 2)
            .unwrap();
        assert_eq!(opts.name.as_deref(), Some("demo-app-2"));
        assert_eq!(opts.entrypoint.as_deref(), Some("/bin/sh"));
        assert_eq!(opts.args, vec!["-c", "echo", "hello"]);
        assert_eq!(opts.env, vec!["A=1", "B"]);
        assert_eq!(
            opts.mounts.volumes,
            vec!["/srv/demo/conf:/etc/app:ro", "demo_cache:/cache", "/logs"]
        );
        assert_eq!(opts.publish, vec!["8080:80"]);
        assert_eq!(opts.restart, RestartPolicy::OnFailure(Some(3)));
        assert_eq!(opts.stop_timeout, Some(90));
        assert_eq!(opts.networks, vec!["host"]);
        assert_eq!(opts.labels[labels::COMPOSE_NUMBER], "2");
        assert_eq!(opts.labels[labels::COMPOSE_SERVICE], "app");
    }

    #[tokio::test]
    async fn test_up_detached_creates_project() {
        let (manager, _runtime, _temp) = manager();
        let orchestrator = project(&manager, STACK);
        orchestrator.up(&detached(), &mut Vec::new()).await.unwrap();

        let rows = orchestrator.ps(false, &[]).await.unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.names.as_str()).collect();
        assert_eq!(names, vec!["demo-db-1", "demo-web-1"]);
        assert_eq!(rows[1].labels["tier"], "front");
        assert_eq!(rows[1].labels[labels::COMPOSE_PROJECT], "demo");

        assert!(manager.network().networks().get("demo_default").unwrap().is_some());
        assert!(manager.store().volumes().get("demo_data").is_ok());

        let db = manager.resolve("demo-db-1").await.unwrap();
        let web = manager.resolve("demo-web-1").await.unwrap();
        assert!(db.created_at <= web.created_at);

        // A second up reuses the running containers.
        orchestrator.up(&detached(), &mut Vec::new()).await.unwrap();
        assert_eq!(orchestrator.containers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_service_skips_dependents() {
        let (manager, _runtime, _temp) = manager();
        let yaml = r#"
services:
  db:
    image: example.com/missing:1
    pull_policy: never
  web:
    image: alpine
    command: sleep 1h
    depends_on: [db]
  cache:
    image: alpine
    command: sleep 1h
"#;
        let orchestrator = project(&manager, yaml);
        let err = orchestrator.up(&detached(), &mut Vec::new()).await.unwrap_err();
        match err {
            CtlError::Multiple(failures) => {
                let ops: Vec<&str> = failures.iter().map(|(op, _)| op.as_str()).collect();
                assert_eq!(ops, vec!["service:db", "service:web"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        let names: Vec<String> = orchestrator
            .containers()
            .await
            .unwrap()
            .iter()
            .map(ContainerManager::name_of)
            .collect();
        assert_eq!(names, vec!["demo-cache-1"]);
    }

    #[tokio::test]
    async fn test_stop_start_and_down() {
        let (manager, _runtime, _temp) = manager();
        let orchestrator = project(&manager, STACK);
        orchestrator.up(&detached(), &mut Vec::new()).await.unwrap();

        orchestrator
            .stop(&[], Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(orchestrator.ps(false, &[]).await.unwrap().is_empty());
        assert_eq!(orchestrator.ps(true, &[]).await.unwrap().len(), 2);

        orchestrator.start(&["db".to_string()]).await.unwrap();
        let running = orchestrator.ps(false, &[]).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].names, "demo-db-1");

        orchestrator
            .down(&DownOptions {
                volumes: true,
                timeout: Some(Duration::from_secs(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(orchestrator.containers().await.unwrap().is_empty());
        assert!(manager.network().networks().get("demo_default").unwrap().is_none());
        assert!(manager.store().volumes().get("demo_data").is_err());
    }

    #[tokio::test]
    async fn test_start_without_containers_is_refused() {
        let (manager, _runtime, _temp) = manager();
        let orchestrator = project(&manager, STACK);
        assert!(orchestrator.start(&[]).await.is_err());
        assert!(orchestrator.start(&["nope".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_run_one_off() {
        let (manager, _runtime, _temp) = manager();
        let orchestrator = project(&manager, STACK);
        let (local, _out, _err) = capture(None);
        let opts = RunOptions {
            service: "web".into(),
            args: vec!["sleep".into(), "1h".into()],
            detach: true,
            ..Default::default()
        };
        let id = orchestrator.run(&opts, local).await.unwrap();
        let record = manager.resolve(&id).await.unwrap();
        assert_eq!(record.label(labels::COMPOSE_ONEOFF), Some("True"));
        assert!(ContainerManager::name_of(&record).starts_with("demo-web-run-"));
        // The dependency came up first.
        let db = manager.resolve("demo-db-1").await.unwrap();
        assert!(manager.state(&db).await.unwrap().is_running());
        // One-off containers are not service replicas.
        assert!(orchestrator.service_containers("web", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logs_are_prefixed() {
        let (manager, _runtime, _temp) = manager();
        let orchestrator = project(&manager, STACK);
        orchestrator.create(&UpOptions::default()).await.unwrap();
        let web = manager.resolve("demo-web-1").await.unwrap();
        let dir = manager.store().container(&web.id);
        let mut writer = JsonFileWriter::open(dir.log_path(), 0, 1, false).unwrap();
        writer.write(&LogEntry::new("stdout", "ready\n")).unwrap();

        let mut out = Vec::new();
        orchestrator
            .logs(&["web".to_string()], &LogsOptions::default(), &mut out)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "demo-web-1 | ready\n");
    }

    #[tokio::test]
    async fn test_attached_up_ends_when_containers_exit() {
        let (manager, _runtime, _temp) = manager();
        let yaml = "services:\n  web:\n    image: alpine\n    command: sleep 1h\n";
        let orchestrator = project(&manager, yaml);
        orchestrator.up(&detached(), &mut Vec::new()).await.unwrap();
        let web = manager.resolve("demo-web-1").await.unwrap();
        let dir = manager.store().container(&web.id);
        let mut writer = JsonFileWriter::open(dir.log_path(), 0, 1, false).unwrap();
        writer.write(&LogEntry::new("stdout", "before\n")).unwrap();

        let stopper = manager.clone();
        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer.write(&LogEntry::new("stdout", "after\n")).unwrap();
            stopper
                .stop("demo-web-1", Some(Duration::from_secs(1)))
                .await
                .unwrap();
        });
        let mut out = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(10),
            orchestrator.up(&UpOptions::default(), &mut out),
        )
        .await
        .unwrap()
        .unwrap();
        stop.await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "demo-web-1 | before\ndemo-web-1 | after\n"
        );
    }
}
