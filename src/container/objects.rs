//! `network` and `volume` verbs
//!
//! Both object kinds are plain client-side state; the only coupling to
//! containers is the in-use check before removal.

use super::{labels, ContainerManager};
use crate::error::{CtlError, Result};
use crate::network::{NetworkConfig, NetworkCreate};
use crate::spec::{MountKind, MountPoint};
use crate::store::Volume;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct IpamConfig {
    #[serde(rename = "Subnet")]
    pub subnet: String,
    #[serde(rename = "Gateway", skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(rename = "IPRange", skip_serializing_if = "Option::is_none")]
    pub ip_range: Option<String>,
}

/// `network inspect` output
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInspect {
    pub name: String,
    #[serde(rename = "Id")]
    pub id: String,
    pub created: DateTime<Utc>,
    pub driver: String,
    #[serde(rename = "IPAM")]
    pub ipam: BTreeMap<String, Vec<IpamConfig>>,
    pub options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// IDs of attached containers
    pub containers: Vec<String>,
}

impl NetworkInspect {
    fn new(network: &NetworkConfig, containers: Vec<String>) -> Self {
        let pools = network
            .ipam
            .iter()
            .map(|pool| IpamConfig {
                subnet: pool.subnet.clone(),
                gateway: pool.gateway.clone(),
                ip_range: pool.ip_range.clone(),
            })
            .collect();
        Self {
            name: network.name.clone(),
            id: network.id.clone(),
            created: network.created,
            driver: network.driver.to_string(),
            ipam: BTreeMap::from([("Config".to_string(), pools)]),
            options: network.options.clone(),
            labels: network.labels.clone(),
            containers,
        }
    }
}

/// Run `op` for every query, collecting failures instead of stopping
fn for_each<T>(queries: &[String], mut op: impl FnMut(&str) -> Result<T>) -> Result<Vec<T>> {
    let mut done = Vec::new();
    let mut failures = Vec::new();
    for query in queries {
        match op(query) {
            Ok(value) => done.push(value),
            Err(e) => failures.push((query.clone(), e)),
        }
    }
    match failures.len() {
        0 => Ok(done),
        1 => Err(failures.remove(0).1),
        _ => Err(CtlError::Multiple(failures)),
    }
}

impl ContainerManager {
    pub fn network_create(&self, opts: NetworkCreate) -> Result<NetworkConfig> {
        self.network.networks().create(opts)
    }

    /// All networks, the default `bridge` included
    pub fn network_ls(&self) -> Result<Vec<NetworkConfig>> {
        self.network.networks().ensure_default()?;
        self.network.networks().list()
    }

    pub fn network_inspect(&self, queries: &[String]) -> Result<Vec<NetworkInspect>> {
        for_each(queries, |query| {
            let network = self.network.resolve(query)?;
            let containers = self.network.attached_containers(&network)?;
            Ok(NetworkInspect::new(&network, containers))
        })
    }

    /// `network rm`; networks with attached containers are refused
    pub fn network_rm(&self, queries: &[String]) -> Result<Vec<String>> {
        for_each(queries, |query| {
            let network = self.network.resolve(query)?;
            let attached = self.network.attached_containers(&network)?;
            if !attached.is_empty() {
                let ids: Vec<&str> = attached.iter().map(|id| crate::error::short_id(id)).collect();
                return Err(CtlError::conflict(
                    format!("network {} is in use by container(s) {}", network.name, ids.join(", ")),
                    "remove the containers attached to the network first",
                ));
            }
            self.network.networks().remove(&network)?;
            info!("removed network {}", network.name);
            Ok(network.name)
        })
    }

    pub fn volume_create(&self, name: Option<&str>, labels: BTreeMap<String, String>) -> Result<Volume> {
        self.store.volumes().create(name, labels)
    }

    pub fn volume_ls(&self) -> Result<Vec<Volume>> {
        self.store.volumes().list()
    }

    pub fn volume_inspect(&self, queries: &[String]) -> Result<Vec<Volume>> {
        for_each(queries, |query| self.resolver().volume(query))
    }

    /// Names of containers whose mounts reference `volume`
    async fn volume_users(&self, volume: &str) -> Result<Vec<String>> {
        let mut users = Vec::new();
        for record in self.runtime.list_containers(self.ns()).await? {
            let mounts: Vec<MountPoint> = record
                .label(labels::MOUNTS)
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default();
            if mounts
                .iter()
                .any(|m| m.kind == MountKind::Volume && m.name == volume)
            {
                users.push(Self::name_of(&record));
            }
        }
        Ok(users)
    }

    /// `volume rm`; volumes in use are refused unless `force`
    pub async fn volume_rm(&self, queries: &[String], force: bool) -> Result<Vec<String>> {
        let mut checked = Vec::new();
        for query in queries {
            let users = if force {
                Vec::new()
            } else {
                self.volume_users(query).await?
            };
            checked.push((query.clone(), users));
        }
        let mut removed = Vec::new();
        let mut failures = Vec::new();
        for (name, users) in checked {
            let result = if users.is_empty() {
                self.store.volumes().remove(&name)
            } else {
                Err(CtlError::VolumeInUse {
                    name: name.clone(),
                    containers: users,
                })
            };
            match result {
                Ok(()) => removed.push(name),
                Err(e) => failures.push((name, e)),
            }
        }
        match failures.len() {
            0 => Ok(removed),
            1 => Err(failures.remove(0).1),
            _ => Err(CtlError::Multiple(failures)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{manager, options};
    use super::*;
    use crate::spec::mounts::MountRequests;

    #[tokio::test]
    async fn test_network_lifecycle() {
        let (manager, _runtime, _temp) = manager();
        let created = manager
            .network_create(NetworkCreate {
                name: "front".into(),
                subnets: vec!["10.9.0.0/24".into()],
                ..Default::default()
            })
            .unwrap();
        let names: Vec<String> = manager.network_ls().unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["bridge".to_string(), "front".to_string()]);

        let info = manager.network_inspect(&["front".to_string()]).unwrap();
        assert_eq!(info[0].id, created.id);
        assert_eq!(info[0].ipam["Config"][0].subnet, "10.9.0.0/24");
        assert!(info[0].containers.is_empty());

        assert!(manager.network_rm(&["bridge".to_string()]).is_err());
        assert_eq!(manager.network_rm(&["front".to_string()]).unwrap(), vec!["front"]);
        assert!(manager.network_inspect(&["front".to_string()]).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_network_in_use_is_refused() {
        let (manager, _runtime, _temp) = manager();
        manager
            .network_create(NetworkCreate {
                name: "back".into(),
                ..Default::default()
            })
            .unwrap();
        let mut opts = options(&["true"]);
        opts.networks = vec!["back".into()];
        let record = manager.create(&opts).await.unwrap();

        let info = manager.network_inspect(&["back".to_string()]).unwrap();
        assert_eq!(info[0].containers, vec![record.id.clone()]);
        let err = manager.network_rm(&["back".to_string()]).unwrap_err();
        assert!(err.hint().is_some());
        assert_eq!(err.exit_code(), 125);
    }

    #[tokio::test]
    async fn test_volume_in_use_needs_force() {
        let (manager, _runtime, _temp) = manager();
        manager.volume_create(Some("data"), BTreeMap::new()).unwrap();
        let mut opts = options(&["true"]);
        opts.mounts = MountRequests {
            volumes: vec!["data:/var/lib/data".into()],
            ..Default::default()
        };
        opts.name = Some("user".into());
        manager.create(&opts).await.unwrap();

        let err = manager.volume_rm(&["data".to_string()], false).await.unwrap_err();
        match err {
            CtlError::VolumeInUse { containers, .. } => assert_eq!(containers, vec!["user"]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            manager.volume_rm(&["data".to_string()], true).await.unwrap(),
            vec!["data"]
        );
        assert!(manager.volume_ls().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_volume_inspect() {
        let (manager, _runtime, _temp) = manager();
        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "db".to_string());
        manager.volume_create(Some("pg"), labels).unwrap();
        let info = manager.volume_inspect(&["pg".to_string()]).unwrap();
        assert_eq!(info[0].driver, "local");
        assert!(info[0].mountpoint.ends_with("pg/_data"));
        let json = serde_json::to_value(&info[0]).unwrap();
        assert_eq!(json["Labels"]["tier"], "db");
        assert!(manager.volume_inspect(&["nope".to_string()]).is_err());
    }
}
