//! Per-container network endpoint records
//!
//! `endpoints.json` lives in the container directory and survives stop/start
//! cycles. An endpoint moves Allocated -> Pending (ADD issued) -> Attached
//! (ADD result recorded) and back to Allocated after DEL.

use super::cni::PortMapping;
use crate::error::Result;
use crate::store::{read_json, write_json, ContainerDir};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Allocated,
    Pending,
    Attached,
}

/// A container's attachment to one network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// `<containerID>_<networkName>`
    pub name: String,
    pub network: String,
    pub network_id: String,
    pub ifname: String,
    pub state: EndpointState,
    /// Last ADD result, replayed as `prevResult` on DEL
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

impl Endpoint {
    pub fn new(container_id: &str, network: &str, network_id: &str, index: usize) -> Self {
        Self {
            name: endpoint_name(container_id, network),
            network: network.to_string(),
            network_id: network_id.to_string(),
            ifname: format!("eth{}", index),
            state: EndpointState::Allocated,
            result: None,
            addresses: Vec::new(),
            ports: Vec::new(),
        }
    }

    /// Whether the plugin may hold state for this endpoint
    pub fn needs_del(&self) -> bool {
        self.state != EndpointState::Allocated
    }
}

pub fn endpoint_name(container_id: &str, network: &str) -> String {
    format!("{}_{}", container_id, network)
}

/// The `endpoints.json` file of one container
#[derive(Debug, Clone)]
pub struct EndpointTable {
    path: PathBuf,
}

impl EndpointTable {
    pub fn new(dir: &ContainerDir) -> Self {
        Self {
            path: dir.endpoints_path(),
        }
    }

    pub fn load(&self) -> Result<Vec<Endpoint>> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, endpoints: &[Endpoint]) -> Result<()> {
        write_json(&self.path, &endpoints)
    }

    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_table_round_trip() {
        let temp = tempdir().unwrap();
        let dir = ContainerDir::new(temp.path().join("c1"), "c1");
        dir.create().unwrap();
        let table = EndpointTable::new(&dir);
        assert!(table.load().unwrap().is_empty());

        let mut endpoint = Endpoint::new("c1", "n1", "nid", 0);
        assert_eq!(endpoint.name, "c1_n1");
        assert!(!endpoint.needs_del());
        endpoint.state = EndpointState::Pending;
        table.save(&[endpoint.clone()]).unwrap();
        assert_eq!(table.load().unwrap(), vec![endpoint]);

        table.remove().unwrap();
        table.remove().unwrap();
    }
}
