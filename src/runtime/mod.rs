//! Runtime daemon adapter
//!
//! The daemon owns all state. It speaks in two object kinds, containers
//! (metadata + spec) and tasks (the live process tree), plus images, content
//! and snapshots. [`Runtime`] is a typed wrapper over that RPC surface;
//! higher layers fold containers and tasks back into a single container
//! abstraction (see [`crate::task::TaskController`]).

pub mod build;
pub mod memory;
pub mod remote;

pub use memory::MemoryRuntime;
pub use remote::RemoteRuntime;

use crate::error::Result;
use crate::reference::image::ImageSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use oci_spec::runtime::{Process, Spec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Timeout for quick queries (list, get, status)
pub const QUICK_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// OCI runtime shim requested for new containers
pub const DEFAULT_OCI_RUNTIME: &str = "io.containerd.runc.v2";

/// Container metadata held by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub spec: Spec,
    pub snapshotter: String,
    pub snapshot_key: String,
    pub runtime: String,
    pub created_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Task state as reported by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Created => write!(f, "created"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Paused => write!(f, "paused"),
            TaskStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Raw exit report of a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    /// Exit status as returned by wait(2) decoding (0-255)
    pub status: u32,
    /// Signal that terminated the process, if any
    pub signal: Option<i32>,
    pub exited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub pid: u32,
    pub status: TaskStatus,
    pub exit: Option<ExitRecord>,
}

/// Client-side FIFOs handed to the daemon for a process's stdio
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FifoSet {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub terminal: bool,
}

/// How the daemon wires a process's stdio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum TaskIo {
    /// Everything goes to /dev/null
    Null,
    /// The daemon opens the client's FIFOs
    Fifos(FifoSet),
    /// The daemon spawns a `binary://` logger (stdout on fd 3, stderr on fd 4,
    /// readiness on fd 5)
    Log { uri: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub exec_id: String,
    pub process: Process,
    pub io: TaskIo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub name: String,
    pub target: Descriptor,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// `os/arch[/variant]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    /// The platform of this host
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: architecture.to_string(),
            variant: None,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let platform = match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            },
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: Some(variant.to_string()),
                }
            }
            _ => {
                return Err(crate::error::CtlError::usage(format!(
                    "invalid platform {:?} (expected os/arch[/variant])",
                    s
                )))
            }
        };
        Ok(platform)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Resolved registry endpoint for a pull or push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEndpoint {
    pub host: String,
    pub url: String,
    pub plain_http: bool,
    pub skip_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub reference: String,
    pub source: ImageSource,
    pub platform: Platform,
    pub endpoint: RegistryEndpoint,
    pub credentials: Option<Credentials>,
    /// Snapshotter to unpack into
    pub unpack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub reference: String,
    pub platform: Option<Platform>,
    pub endpoint: RegistryEndpoint,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub container_id: String,
    pub reference: String,
    pub message: Option<String>,
    pub author: Option<String>,
    pub pause: bool,
}

/// Mount returned by the snapshotter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootfsMount {
    #[serde(rename = "type")]
    pub typ: String,
    pub source: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub parent: Option<String>,
    pub kind: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SnapshotUsage {
    pub size: u64,
    pub inodes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentInfo {
    pub digest: String,
    pub size: u64,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub cpu_usage_ns: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub pids: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub namespace: String,
    pub topic: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

/// Typed RPC surface of the runtime daemon
#[async_trait]
pub trait Runtime: Send + Sync {
    // Containers
    async fn create_container(&self, ns: &str, record: ContainerRecord) -> Result<ContainerRecord>;
    async fn load_container(&self, ns: &str, id: &str) -> Result<ContainerRecord>;
    async fn list_containers(&self, ns: &str) -> Result<Vec<ContainerRecord>>;
    async fn update_labels(
        &self,
        ns: &str,
        id: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<ContainerRecord>;
    async fn update_spec(&self, ns: &str, id: &str, spec: Spec) -> Result<ContainerRecord>;
    /// Delete the container and its snapshot
    async fn delete_container(&self, ns: &str, id: &str) -> Result<()>;

    // Tasks
    async fn create_task(&self, ns: &str, id: &str, io: TaskIo) -> Result<u32>;
    async fn start_task(&self, ns: &str, id: &str) -> Result<()>;
    async fn wait_task(&self, ns: &str, id: &str) -> Result<ExitRecord>;
    async fn kill_task(&self, ns: &str, id: &str, signal: i32, all: bool) -> Result<()>;
    async fn pause_task(&self, ns: &str, id: &str) -> Result<()>;
    async fn resume_task(&self, ns: &str, id: &str) -> Result<()>;
    async fn delete_task(&self, ns: &str, id: &str) -> Result<Option<ExitRecord>>;
    async fn task_status(&self, ns: &str, id: &str) -> Result<TaskInfo>;
    async fn task_pids(&self, ns: &str, id: &str) -> Result<Vec<u32>>;
    async fn task_metrics(&self, ns: &str, id: &str) -> Result<TaskMetrics>;
    async fn resize_pty(
        &self,
        ns: &str,
        id: &str,
        exec_id: Option<&str>,
        width: u16,
        height: u16,
    ) -> Result<()>;
    async fn close_stdin(&self, ns: &str, id: &str, exec_id: Option<&str>) -> Result<()>;

    // Exec processes
    async fn exec_process(&self, ns: &str, id: &str, request: ExecRequest) -> Result<()>;
    async fn start_process(&self, ns: &str, id: &str, exec_id: &str) -> Result<u32>;
    async fn wait_process(&self, ns: &str, id: &str, exec_id: &str) -> Result<ExitRecord>;
    async fn kill_process(&self, ns: &str, id: &str, exec_id: &str, signal: i32) -> Result<()>;
    async fn delete_process(&self, ns: &str, id: &str, exec_id: &str) -> Result<()>;

    // Images
    async fn pull_image(&self, ns: &str, request: PullRequest) -> Result<ImageRecord>;
    async fn push_image(&self, ns: &str, request: PushRequest) -> Result<()>;
    async fn list_images(&self, ns: &str) -> Result<Vec<ImageRecord>>;
    async fn get_image(&self, ns: &str, name: &str) -> Result<ImageRecord>;
    async fn commit_container(&self, ns: &str, request: CommitRequest) -> Result<ImageRecord>;

    // Content
    async fn read_content(&self, ns: &str, digest: &str) -> Result<Vec<u8>>;
    async fn write_content(
        &self,
        ns: &str,
        data: Vec<u8>,
        labels: BTreeMap<String, String>,
    ) -> Result<Descriptor>;
    async fn walk_content(&self, ns: &str) -> Result<Vec<ContentInfo>>;

    // Snapshots
    async fn prepare_snapshot(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
        image: &str,
    ) -> Result<Vec<RootfsMount>>;
    async fn snapshot_mounts(&self, ns: &str, snapshotter: &str, key: &str)
        -> Result<Vec<RootfsMount>>;
    async fn stat_snapshot(&self, ns: &str, snapshotter: &str, key: &str) -> Result<SnapshotInfo>;
    async fn snapshot_usage(&self, ns: &str, snapshotter: &str, key: &str)
        -> Result<SnapshotUsage>;
    async fn remove_snapshot(&self, ns: &str, snapshotter: &str, key: &str) -> Result<()>;

    // Events
    async fn subscribe(&self, ns: &str) -> Result<BoxStream<'static, Result<RuntimeEvent>>>;
}

/// Connect to the daemon named by `--address`
pub fn connect(address: &str) -> Result<Arc<dyn Runtime>> {
    if address == "memory://" {
        return Ok(Arc::new(MemoryRuntime::new()));
    }
    Ok(Arc::new(RemoteRuntime::new(address)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse() {
        let p = Platform::parse("linux/arm64/v8").unwrap();
        assert_eq!(p.architecture, "arm64");
        assert_eq!(p.variant.as_deref(), Some("v8"));
        assert_eq!(p.to_string(), "linux/arm64/v8");
        assert!(Platform::parse("linux").is_err());
        assert!(Platform::parse("linux//").is_err());
    }

    #[test]
    fn test_task_io_wire_format() {
        let io = TaskIo::Log {
            uri: "binary:///usr/bin/logger".to_string(),
        };
        let value = serde_json::to_value(&io).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["uri"], "binary:///usr/bin/logger");
    }
}
