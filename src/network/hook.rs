//! OCI hook handler
//!
//! The runtime invokes `runectl [global flags] internal oci-hook <event>` with
//! the container state on stdin. `createRuntime` attaches the container's CNI
//! endpoints inside its network namespace before the process starts;
//! `poststop` detaches them again.

use super::NetworkCoordinator;
use crate::config::GlobalConfig;
use crate::error::{CtlError, Result};
use crate::store::DataStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info};

/// Container state handed to hooks on stdin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookState {
    #[serde(default)]
    pub oci_version: String,
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub bundle: PathBuf,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl HookState {
    /// Network namespace of the container's init process
    pub fn netns(&self) -> PathBuf {
        match self.pid {
            Some(pid) if pid > 0 => PathBuf::from(format!("/proc/{}/ns/net", pid)),
            _ => PathBuf::new(),
        }
    }
}

/// Hook points the client installs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    CreateRuntime,
    Poststop,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::CreateRuntime => "createRuntime",
            HookEvent::Poststop => "postStop",
        }
    }
}

impl FromStr for HookEvent {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "createRuntime" => Ok(HookEvent::CreateRuntime),
            "postStop" | "poststop" => Ok(HookEvent::Poststop),
            other => Err(CtlError::usage(format!("unexpected hook event {:?}", other))),
        }
    }
}

/// Read the state document from stdin
pub fn read_state(mut input: impl Read) -> Result<HookState> {
    let mut data = Vec::new();
    input.read_to_end(&mut data)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Handle one hook invocation
pub async fn handle(cfg: &GlobalConfig, event: HookEvent, state: &HookState) -> Result<()> {
    let store = DataStore::new(&cfg.data_root, &cfg.namespace);
    let coordinator = NetworkCoordinator::new(cfg, &store);
    dispatch(&coordinator, &store, event, state).await
}

pub(crate) async fn dispatch(
    coordinator: &NetworkCoordinator,
    store: &DataStore,
    event: HookEvent,
    state: &HookState,
) -> Result<()> {
    let dir = store.container(&state.id);
    if !dir.exists() {
        debug!("no state for {}, nothing to do for {}", state.id, event.as_str());
        return Ok(());
    }
    match event {
        HookEvent::CreateRuntime => {
            let addresses = coordinator.attach(&dir, state.netns()).await?;
            info!("attached {} to {} address(es)", state.id, addresses.len());
            store.hosts().set_addresses(&state.id, addresses)
        }
        HookEvent::Poststop => {
            coordinator.detach(&dir, state.netns()).await?;
            store.hosts().set_addresses(&state.id, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::cni::tests::fake_plugin;
    use crate::network::{CniRunner, NetworkCreate, NetworkStore};
    use crate::store::HostsMeta;
    use tempfile::tempdir;

    #[test]
    fn test_state_parse() {
        let state = read_state(
            &br#"{"ociVersion":"1.0.2","id":"abc","status":"creating","pid":4242,"bundle":"/run/b"}"#[..],
        )
        .unwrap();
        assert_eq!(state.id, "abc");
        assert_eq!(state.netns(), PathBuf::from("/proc/4242/ns/net"));
        assert_eq!("poststop".parse::<HookEvent>().unwrap(), HookEvent::Poststop);
        assert!("prestart".parse::<HookEvent>().is_err());
    }

    #[tokio::test]
    async fn test_hooks_refresh_hosts_file() {
        let temp = tempdir().unwrap();
        let bin = temp.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let log = temp.path().join("cni.log");
        for plugin in ["bridge", "portmap", "firewall", "tuning"] {
            fake_plugin(&bin, plugin, &log, &[], "10.4.2.9");
        }

        let store = DataStore::with_host(temp.path().join("root"), "test", "default");
        let networks = NetworkStore::new(temp.path().join("net.d"), "default", store.names());
        networks
            .create(NetworkCreate {
                name: "front".into(),
                ..Default::default()
            })
            .unwrap();
        let coordinator =
            NetworkCoordinator::with_parts(networks, CniRunner::new(vec![bin]), store.clone());

        let dir = store.container("feed");
        dir.create().unwrap();
        coordinator.allocate(&dir, &["front".to_string()], &[]).unwrap();
        store
            .hosts()
            .prepare(&HostsMeta {
                id: "feed".into(),
                name: "web".into(),
                hostname: "feed".into(),
                networks: vec!["front".into()],
                ..Default::default()
            })
            .unwrap();

        let state = HookState {
            id: "feed".into(),
            pid: Some(1),
            ..Default::default()
        };
        dispatch(&coordinator, &store, HookEvent::CreateRuntime, &state)
            .await
            .unwrap();
        let hosts = std::fs::read_to_string(store.hosts().hosts_path("feed")).unwrap();
        assert!(hosts.contains("10.4.2.9\tfeed web"));

        dispatch(&coordinator, &store, HookEvent::Poststop, &state)
            .await
            .unwrap();
        let hosts = std::fs::read_to_string(store.hosts().hosts_path("feed")).unwrap();
        assert!(!hosts.contains("10.4.2.9"));
    }
}
