//! `inspect`: Docker-compatible container JSON

use super::{json_list, labels, ContainerManager, ContainerState, ContainerStatus};
use crate::error::{CtlError, Result};
use crate::network::{EndpointTable, PortMapping};
use crate::runtime::ContainerRecord;
use crate::spec::MountPoint;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Timestamp Docker prints for events that never happened
const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    #[serde(rename = "Id")]
    pub id: String,
    pub created: DateTime<Utc>,
    pub path: String,
    pub args: Vec<String>,
    pub state: InspectState,
    pub image: String,
    pub resolv_conf_path: String,
    pub hostname_path: String,
    pub hosts_path: String,
    pub log_path: String,
    pub name: String,
    pub driver: String,
    pub platform: String,
    pub mounts: Vec<MountPoint>,
    pub config: InspectConfig,
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    pub status: ContainerStatus,
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    pub pid: u32,
    pub exit_code: i32,
    pub started_at: String,
    pub finished_at: String,
}

impl From<&ContainerState> for InspectState {
    fn from(state: &ContainerState) -> Self {
        let stamp = |t: Option<DateTime<Utc>>| {
            t.map(|t| t.to_rfc3339())
                .unwrap_or_else(|| ZERO_TIME.to_string())
        };
        Self {
            status: state.status,
            running: state.is_running(),
            paused: state.status == ContainerStatus::Paused,
            restarting: false,
            pid: state.pid,
            exit_code: state.exit_code,
            started_at: stamp(state.started_at),
            finished_at: stamp(state.finished_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    pub hostname: String,
    pub user: String,
    pub tty: bool,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub image: String,
    pub working_dir: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp")]
    pub host_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEndpoint {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkSettings {
    /// `80/tcp` to its host bindings
    #[serde(rename = "Ports")]
    pub ports: BTreeMap<String, Vec<PortBinding>>,
    /// First address of the first network
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "Networks")]
    pub networks: BTreeMap<String, NetworkEndpoint>,
}

fn port_bindings(ports: &[PortMapping]) -> BTreeMap<String, Vec<PortBinding>> {
    let mut out: BTreeMap<String, Vec<PortBinding>> = BTreeMap::new();
    for port in ports {
        out.entry(format!("{}/{}", port.container_port, port.protocol))
            .or_default()
            .push(PortBinding {
                host_ip: if port.host_ip.is_empty() {
                    "0.0.0.0".to_string()
                } else {
                    port.host_ip.clone()
                },
                host_port: port.host_port.to_string(),
            });
    }
    out
}

impl ContainerManager {
    fn network_settings(&self, record: &ContainerRecord) -> Result<NetworkSettings> {
        let ports: Vec<PortMapping> = record
            .label(labels::PORTS)
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let mut settings = NetworkSettings {
            ports: port_bindings(&ports),
            ..Default::default()
        };
        let endpoints = EndpointTable::new(&self.store.container(&record.id)).load()?;
        for endpoint in endpoints {
            let ip = endpoint.addresses.first().cloned().unwrap_or_default();
            if settings.ip_address.is_empty() {
                settings.ip_address = ip.clone();
            }
            settings.networks.insert(
                endpoint.network.clone(),
                NetworkEndpoint {
                    network_id: endpoint.network_id.clone(),
                    ip_address: ip,
                },
            );
        }
        Ok(settings)
    }

    async fn inspect_record(&self, record: &ContainerRecord) -> Result<ContainerInspect> {
        let state = self.state(record).await?;
        let dir = self.store.container(&record.id);
        let process = record.spec.process().as_ref();
        let args: Vec<String> = process.and_then(|p| p.args().clone()).unwrap_or_default();
        let mounts: Vec<MountPoint> = record
            .label(labels::MOUNTS)
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let image = record
            .label(labels::IMAGE_REF)
            .unwrap_or(&record.image)
            .to_string();
        let hosts_path = match json_list(record, labels::NETWORKS).first() {
            Some(mode) if mode == "host" => "/etc/hosts".to_string(),
            _ => self.store.hosts().hosts_path(&record.id).display().to_string(),
        };
        Ok(ContainerInspect {
            id: record.id.clone(),
            created: record.created_at,
            path: args.first().cloned().unwrap_or_default(),
            args: args.iter().skip(1).cloned().collect(),
            state: InspectState::from(&state),
            image: image.clone(),
            resolv_conf_path: dir.resolv_conf_path().display().to_string(),
            hostname_path: dir.hostname_path().display().to_string(),
            hosts_path,
            log_path: dir.log_path().display().to_string(),
            name: Self::name_of(record),
            driver: record.snapshotter.clone(),
            platform: record.label(labels::PLATFORM).unwrap_or("linux").to_string(),
            mounts,
            config: InspectConfig {
                hostname: record.label(labels::HOSTNAME).unwrap_or_default().to_string(),
                user: record.label(labels::USER).unwrap_or_default().to_string(),
                tty: process.and_then(|p| p.terminal()).unwrap_or(false),
                env: process.and_then(|p| p.env().clone()).unwrap_or_default(),
                cmd: args,
                image,
                working_dir: process
                    .map(|p| p.cwd().display().to_string())
                    .unwrap_or_default(),
                labels: super::ps::user_labels(record),
            },
            network_settings: self.network_settings(record)?,
        })
    }

    /// `inspect`; every reference is tried and failures are reported together
    pub async fn inspect(&self, queries: &[String]) -> Result<Vec<ContainerInspect>> {
        let mut found = Vec::new();
        let mut failures = Vec::new();
        for query in queries {
            let result = match self.resolve(query).await {
                Ok(record) => self.inspect_record(&record).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(info) => found.push(info),
                Err(e) => failures.push((query.clone(), e)),
            }
        }
        match failures.len() {
            0 => Ok(found),
            1 if queries.len() == 1 => Err(failures.remove(0).1),
            _ => Err(CtlError::Multiple(failures)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{capture, manager, options};
    use super::*;

    #[tokio::test]
    async fn test_inspect_created_container() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["echo", "hello", "world"]);
        opts.name = Some("peek".into());
        opts.labels.insert("team".into(), "infra".into());
        let record = manager.create(&opts).await.unwrap();

        let info = manager.inspect(&["peek".to_string()]).await.unwrap();
        assert_eq!(info.len(), 1);
        let info = &info[0];
        assert_eq!(info.id, record.id);
        assert_eq!(info.name, "peek");
        assert_eq!(info.path, "echo");
        assert_eq!(info.args, vec!["hello", "world"]);
        assert_eq!(info.state.status, ContainerStatus::Created);
        assert_eq!(info.state.started_at, ZERO_TIME);
        assert_eq!(info.config.labels.get("team").map(String::as_str), Some("infra"));
        assert!(info.network_settings.networks.is_empty());

        let json = serde_json::to_value(info).unwrap();
        assert_eq!(json["Id"], record.id.as_str());
        assert_eq!(json["State"]["Status"], "created");
        assert!(json["NetworkSettings"]["IPAddress"].is_string());
    }

    #[tokio::test]
    async fn test_inspect_exited_container() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["sh", "-c", "exit 3"]);
        opts.name = Some("done".into());
        let (local, _out, _err) = capture(None);
        assert!(manager.run(&opts, local).await.is_err());

        let info = manager.inspect(&["done".to_string()]).await.unwrap();
        assert_eq!(info[0].state.status, ContainerStatus::Exited);
        assert_eq!(info[0].state.exit_code, 3);
        assert!(!info[0].state.running);
        assert_ne!(info[0].state.finished_at, ZERO_TIME);
    }

    #[tokio::test]
    async fn test_inspect_reports_every_missing_reference() {
        let (manager, _runtime, _temp) = manager();
        let err = manager
            .inspect(&["ghost".to_string(), "phantom".to_string()])
            .await
            .unwrap_err();
        match err {
            CtlError::Multiple(failures) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(manager
            .inspect(&["ghost".to_string()])
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_port_bindings() {
        let ports = vec![PortMapping {
            host_port: 8080,
            container_port: 80,
            protocol: "tcp".into(),
            host_ip: String::new(),
        }];
        let bindings = port_bindings(&ports);
        assert_eq!(bindings["80/tcp"][0].host_ip, "0.0.0.0");
        assert_eq!(bindings["80/tcp"][0].host_port, "8080");
    }
}
