//! Container lifecycle orchestration
//!
//! [`ContainerManager`] implements the container verbs on top of the runtime
//! adapter. Each verb lives in its own file as an `impl ContainerManager`
//! block; this file holds the shared plumbing: construction, reference
//! resolution with lazy reaping, and folding a container and its task into
//! one [`ContainerState`].

pub mod attach;
pub mod config;
pub mod cp;
pub mod create;
pub mod exec;
pub mod images;
pub mod inspect;
pub mod labels;
pub mod lifecycle;
pub mod logs;
pub mod objects;
pub mod ps;
pub mod run;
pub mod stats;
pub mod top;

pub use config::{ContainerState, ContainerStatus, CreateOptions, RestartPolicy};
pub use exec::ExecRequestOptions;
pub use lifecycle::RemoveOptions;
pub use ps::ContainerSummary;

use crate::config::GlobalConfig;
use crate::error::{CtlError, ObjectKind, Result};
use crate::image::ImageService;
use crate::network::NetworkCoordinator;
use crate::reference::Resolver;
use crate::registry::RegistryResolver;
use crate::runtime::{ContainerRecord, Runtime, TaskStatus};
use crate::signals::SignalRouter;
use crate::store::DataStore;
use crate::task::{exit_code, TaskController};
use rand::Rng;
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Whether `name` is acceptable as a container or volume name
pub fn is_valid_name(name: &str) -> bool {
    static NAME: OnceLock<Option<Regex>> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]+$").ok())
        .as_ref()
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

/// Fresh 64-hex-digit container ID
pub fn new_id() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Drives containers of one namespace
#[derive(Clone)]
pub struct ContainerManager {
    cfg: GlobalConfig,
    runtime: Arc<dyn Runtime>,
    store: DataStore,
    images: ImageService,
    network: NetworkCoordinator,
    tasks: TaskController,
    router: SignalRouter,
    /// Binary the runtime runs for hooks and the log driver
    exe: PathBuf,
}

impl ContainerManager {
    /// Manager for the namespace selected by `cfg`
    pub fn new(cfg: GlobalConfig, runtime: Arc<dyn Runtime>, router: SignalRouter) -> Result<Self> {
        let store = DataStore::new(&cfg.data_root, &cfg.namespace);
        let network = NetworkCoordinator::new(&cfg, &store);
        let exe = std::env::current_exe()?;
        Ok(Self::with_parts(cfg, runtime, store, network, router, exe))
    }

    pub fn with_parts(
        cfg: GlobalConfig,
        runtime: Arc<dyn Runtime>,
        store: DataStore,
        network: NetworkCoordinator,
        router: SignalRouter,
        exe: PathBuf,
    ) -> Self {
        let registry = RegistryResolver::new(
            cfg.hosts_dir.clone(),
            cfg.insecure_registries.clone(),
            store.auth_file(),
        );
        let images = ImageService::new(
            runtime.clone(),
            store.clone(),
            registry,
            cfg.snapshotter.clone(),
        );
        let tasks = TaskController::new(runtime.clone(), cfg.namespace.clone());
        Self {
            cfg,
            runtime,
            store,
            images,
            network,
            tasks,
            router,
            exe,
        }
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.cfg
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn images(&self) -> &ImageService {
        &self.images
    }

    pub fn network(&self) -> &NetworkCoordinator {
        &self.network
    }

    pub fn tasks(&self) -> &TaskController {
        &self.tasks
    }

    pub fn router(&self) -> &SignalRouter {
        &self.router
    }

    /// Root cancellation token of this command
    pub fn cancel_token(&self) -> CancellationToken {
        self.router.root()
    }

    fn ns(&self) -> &str {
        &self.cfg.namespace
    }

    pub(crate) fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self.runtime.as_ref(), &self.store)
    }

    /// Resolve a container reference
    ///
    /// An exited `--rm` container whose client went away is removed here
    /// and reported as not found.
    pub async fn resolve(&self, query: &str) -> Result<ContainerRecord> {
        let record = self.resolver().container(query).await?;
        if self.reap_if_orphaned(&record).await? {
            return Err(CtlError::not_found(ObjectKind::Container, query));
        }
        Ok(record)
    }

    /// Remove an auto-remove container that has already exited
    pub(crate) async fn reap_if_orphaned(&self, record: &ContainerRecord) -> Result<bool> {
        if record.label(labels::AUTO_REMOVE) != Some("true") {
            return Ok(false);
        }
        let state = self.state(record).await?;
        if state.status != ContainerStatus::Exited {
            return Ok(false);
        }
        info!("reaping exited auto-remove container {}", record.id);
        self.remove_record(record, &RemoveOptions::auto_remove()).await?;
        Ok(true)
    }

    /// Fold the container and its task into one state
    pub async fn state(&self, record: &ContainerRecord) -> Result<ContainerState> {
        let saved = self
            .store
            .container(&record.id)
            .process_record()
            .unwrap_or_default();
        let state = match self.tasks.status(&record.id).await? {
            Some(info) => {
                let status = if info.status == TaskStatus::Created && saved.started_at.is_some() {
                    // A restart whose new task is not running yet.
                    ContainerStatus::Exited
                } else {
                    ContainerStatus::from(info.status)
                };
                let running = matches!(info.status, TaskStatus::Running | TaskStatus::Paused);
                ContainerState {
                    status,
                    pid: if running { info.pid } else { 0 },
                    exit_code: info
                        .exit
                        .as_ref()
                        .map(exit_code)
                        .or(saved.exit_code)
                        .unwrap_or(0),
                    started_at: saved.started_at,
                    finished_at: if running {
                        None
                    } else {
                        info.exit.map(|e| e.exited_at).or(saved.finished_at)
                    },
                }
            }
            None => ContainerState {
                status: if saved.started_at.is_some() {
                    ContainerStatus::Exited
                } else {
                    ContainerStatus::Created
                },
                pid: 0,
                exit_code: saved.exit_code.unwrap_or(0),
                started_at: saved.started_at,
                finished_at: saved.finished_at,
            },
        };
        debug!("{} is {}", record.id, state.status);
        Ok(state)
    }

    /// User-visible name of a container
    pub fn name_of(record: &ContainerRecord) -> String {
        record
            .label(labels::NAME)
            .map(str::to_string)
            .unwrap_or_else(|| crate::error::short_id(&record.id).to_string())
    }
}

/// Parse a JSON list label, tolerating its absence
pub(crate) fn json_list(record: &ContainerRecord, key: &str) -> Vec<String> {
    record
        .label(key)
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default()
}
