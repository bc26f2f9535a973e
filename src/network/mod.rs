//! Container networking
//!
//! Four modes: `none`, `host`, `container:<ref>` and one or more named CNI
//! networks. For named networks the coordinator allocates endpoint records at
//! create time; the actual plugin calls happen in the OCI hooks
//! ([`hook`]) so the process sees its network before it starts.

pub mod cni;
pub mod config;
pub mod endpoint;
pub mod hook;

pub use cni::{CniRunner, PortMapping};
pub use config::{NetworkConfig, NetworkCreate, NetworkDriver, NetworkStore, DEFAULT_NETWORK};
pub use endpoint::{Endpoint, EndpointState, EndpointTable};

use crate::config::GlobalConfig;
use crate::error::{CtlError, ObjectKind, Result};
use crate::store::{ContainerDir, DataStore};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Network mode selected by `--net`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    None,
    Host,
    /// Share the network namespace of another container
    Container(String),
    /// Attach to named CNI networks in order
    Named(Vec<String>),
}

impl NetworkMode {
    /// Interpret the (possibly repeated) `--net` values
    pub fn parse(values: &[String]) -> Result<Self> {
        let values: Vec<&str> = values
            .iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();
        match values.as_slice() {
            [] => Ok(NetworkMode::Named(vec![DEFAULT_NETWORK.to_string()])),
            ["none"] => Ok(NetworkMode::None),
            ["host"] => Ok(NetworkMode::Host),
            [single] if single.starts_with("container:") => {
                let target = &single["container:".len()..];
                if target.is_empty() {
                    return Err(CtlError::usage("--net container: needs a container reference"));
                }
                Ok(NetworkMode::Container(target.to_string()))
            }
            many => {
                if many
                    .iter()
                    .any(|v| *v == "none" || *v == "host" || v.starts_with("container:"))
                {
                    return Err(CtlError::usage(
                        "none, host and container: network modes cannot be combined with other networks",
                    ));
                }
                let mut names: Vec<String> = Vec::new();
                for name in many {
                    let name = if *name == "default" { DEFAULT_NETWORK } else { name };
                    if !names.iter().any(|n| n == name) {
                        names.push(name.to_string());
                    }
                }
                Ok(NetworkMode::Named(names))
            }
        }
    }

    pub fn networks(&self) -> &[String] {
        match self {
            NetworkMode::Named(names) => names,
            _ => &[],
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::None => write!(f, "none"),
            NetworkMode::Host => write!(f, "host"),
            NetworkMode::Container(target) => write!(f, "container:{}", target),
            NetworkMode::Named(names) => write!(f, "{}", names.join(",")),
        }
    }
}

/// Parse one `-p [hostIP:][hostPort:]containerPort[/proto]` value
///
/// Ranges (`8000-8001:80-81`) expand to one mapping per port; a missing host
/// port is left as 0 and allocated later.
pub fn parse_publish(value: &str) -> Result<Vec<PortMapping>> {
    let invalid = || CtlError::usage(format!("invalid publish spec {:?}", value));
    let (ports, protocol) = match value.rsplit_once('/') {
        Some((ports, proto)) => (ports, proto.to_lowercase()),
        None => (value, "tcp".to_string()),
    };
    if !matches!(protocol.as_str(), "tcp" | "udp" | "sctp") {
        return Err(invalid());
    }

    // An IPv6 host address is bracketed: [::1]:8080:80
    let (host_ip, rest) = if let Some(stripped) = ports.strip_prefix('[') {
        let (ip, rest) = stripped.split_once("]:").ok_or_else(invalid)?;
        (ip.to_string(), rest)
    } else {
        let parts: Vec<&str> = ports.split(':').collect();
        match parts.len() {
            1 | 2 => (String::new(), ports),
            3 => (parts[0].to_string(), &ports[parts[0].len() + 1..]),
            _ => return Err(invalid()),
        }
    };
    if !host_ip.is_empty() && host_ip.parse::<std::net::IpAddr>().is_err() {
        return Err(invalid());
    }

    let (host, container) = match rest.split_once(':') {
        Some((host, container)) => (host, container),
        None => ("", rest),
    };
    let container_range = parse_range(container).ok_or_else(invalid)?;
    let host_range = if host.is_empty() {
        None
    } else {
        Some(parse_range(host).ok_or_else(invalid)?)
    };

    let count = container_range.1 - container_range.0 + 1;
    if let Some((start, end)) = host_range {
        if end - start + 1 != count {
            return Err(CtlError::usage(format!(
                "invalid publish spec {:?}: host and container port ranges differ in size",
                value
            )));
        }
    }

    Ok((0..count)
        .map(|i| PortMapping {
            host_port: host_range.map(|(start, _)| start + i).unwrap_or(0),
            container_port: container_range.0 + i,
            protocol: protocol.clone(),
            host_ip: host_ip.clone(),
        })
        .collect())
}

fn parse_range(s: &str) -> Option<(u16, u16)> {
    let (start, end) = match s.split_once('-') {
        Some((a, b)) => (a.parse().ok()?, b.parse().ok()?),
        None => {
            let p: u16 = s.parse().ok()?;
            (p, p)
        }
    };
    if start == 0 || end < start {
        return None;
    }
    Some((start, end))
}

/// Pick a free host port from the ephemeral range
fn allocate_host_port(protocol: &str, host_ip: &str) -> Result<u16> {
    let ip = if host_ip.is_empty() { "0.0.0.0" } else { host_ip };
    let port = if protocol == "udp" {
        std::net::UdpSocket::bind((ip, 0))?.local_addr()?.port()
    } else {
        std::net::TcpListener::bind((ip, 0))?.local_addr()?.port()
    };
    Ok(port)
}

/// Derive the container's resolv.conf from the host's
pub fn resolv_conf(host: &str, dns: &[String], search: &[String], options: &[String]) -> String {
    let mut nameservers: Vec<String> = Vec::new();
    let mut host_search: Vec<String> = Vec::new();
    let mut host_options: Vec<String> = Vec::new();
    for line in host.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("nameserver") => {
                if let Some(ns) = fields.next() {
                    let loopback = ns
                        .parse::<std::net::IpAddr>()
                        .map(|ip| ip.is_loopback())
                        .unwrap_or(false);
                    if !loopback {
                        nameservers.push(ns.to_string());
                    }
                }
            }
            Some("search") | Some("domain") => host_search.extend(fields.map(str::to_string)),
            Some("options") => host_options.extend(fields.map(str::to_string)),
            _ => {}
        }
    }
    if !dns.is_empty() {
        nameservers = dns.to_vec();
    } else if nameservers.is_empty() {
        nameservers = vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()];
    }
    let search = if search.is_empty() { host_search } else { search.to_vec() };
    let options = if options.is_empty() { host_options } else { options.to_vec() };

    let mut out = String::new();
    if !search.is_empty() {
        out.push_str(&format!("search {}\n", search.join(" ")));
    }
    for ns in nameservers {
        out.push_str(&format!("nameserver {}\n", ns));
    }
    if !options.is_empty() {
        out.push_str(&format!("options {}\n", options.join(" ")));
    }
    out
}

/// Allocates endpoints and runs the plugin chain for named networks
#[derive(Debug, Clone)]
pub struct NetworkCoordinator {
    networks: NetworkStore,
    cni: CniRunner,
    store: DataStore,
}

impl NetworkCoordinator {
    pub fn new(cfg: &GlobalConfig, store: &DataStore) -> Self {
        Self {
            networks: NetworkStore::new(cfg.cni_netconfpath.clone(), &cfg.namespace, store.names()),
            cni: CniRunner::from_path(&cfg.cni_path),
            store: store.clone(),
        }
    }

    pub fn with_parts(networks: NetworkStore, cni: CniRunner, store: DataStore) -> Self {
        Self {
            networks,
            cni,
            store,
        }
    }

    pub fn networks(&self) -> &NetworkStore {
        &self.networks
    }

    /// Resolve a network by ID, name or unique ID prefix
    pub fn resolve(&self, query: &str) -> Result<NetworkConfig> {
        if query == DEFAULT_NETWORK {
            return self.networks.ensure_default();
        }
        crate::reference::resolve_network(&self.networks.list()?, query)
    }

    /// Record endpoints for a new container; networks must already exist
    pub fn allocate(
        &self,
        dir: &ContainerDir,
        names: &[String],
        ports: &[PortMapping],
    ) -> Result<Vec<Endpoint>> {
        let mut ports = ports.to_vec();
        for port in ports.iter_mut().filter(|p| p.host_port == 0) {
            port.host_port = allocate_host_port(&port.protocol, &port.host_ip)?;
        }

        let mut endpoints = Vec::new();
        for (index, name) in names.iter().enumerate() {
            let network = self.resolve(name)?;
            let mut endpoint = Endpoint::new(dir.id(), &network.name, &network.id, index);
            // Published ports ride on the first network.
            if index == 0 {
                endpoint.ports = ports.clone();
            }
            endpoints.push(endpoint);
        }
        EndpointTable::new(dir).save(&endpoints)?;
        debug!("allocated {} endpoint(s) for {}", endpoints.len(), dir.id());
        Ok(endpoints)
    }

    fn conflist(&self, endpoint: &Endpoint) -> Result<Value> {
        let network = self
            .networks
            .list()?
            .into_iter()
            .find(|n| n.id == endpoint.network_id || n.name == endpoint.network)
            .ok_or_else(|| CtlError::not_found(ObjectKind::Network, endpoint.network.clone()))?;
        let data = std::fs::read(&network.file)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn runtime_conf(&self, id: &str, netns: &PathBuf, endpoint: &Endpoint) -> cni::RuntimeConf {
        cni::RuntimeConf {
            container_id: id.to_string(),
            netns: netns.clone(),
            ifname: endpoint.ifname.clone(),
            args: vec![
                ("IgnoreUnknown".to_string(), "1".to_string()),
                (
                    "K8S_POD_NAMESPACE".to_string(),
                    self.store.namespace().to_string(),
                ),
                ("K8S_POD_NAME".to_string(), id.to_string()),
            ],
            port_mappings: endpoint.ports.clone(),
        }
    }

    /// CNI ADD for every endpoint in order
    ///
    /// Endpoints left `pending` or `attached` by an earlier run are DEL'd
    /// first. If any ADD fails, the ones already added are DEL'd before the
    /// error is returned. Returns the (network, address) pairs assigned.
    pub async fn attach(&self, dir: &ContainerDir, netns: PathBuf) -> Result<Vec<(String, String)>> {
        let table = EndpointTable::new(dir);
        let mut endpoints = table.load()?;

        for endpoint in endpoints.iter_mut().filter(|e| e.needs_del()) {
            let conflist = self.conflist(endpoint)?;
            let rt = self.runtime_conf(dir.id(), &netns, endpoint);
            if let Err(e) = self.cni.del(&conflist, &rt, endpoint.result.as_ref()).await {
                debug!("reconcile DEL of {} failed: {}", endpoint.name, e);
            }
            endpoint.state = EndpointState::Allocated;
            endpoint.result = None;
            endpoint.addresses.clear();
        }
        table.save(&endpoints)?;

        for i in 0..endpoints.len() {
            if let Err(err) = self.add_one(dir, &netns, &table, &mut endpoints, i).await {
                self.roll_back(dir, &netns, &mut endpoints[..=i]).await;
                if let Err(e) = table.save(&endpoints) {
                    warn!("failed to record rollback of {}: {}", dir.id(), e);
                }
                return Err(err);
            }
        }

        Ok(endpoints
            .iter()
            .flat_map(|e| e.addresses.iter().map(|a| (e.network.clone(), a.clone())))
            .collect())
    }

    async fn add_one(
        &self,
        dir: &ContainerDir,
        netns: &PathBuf,
        table: &EndpointTable,
        endpoints: &mut [Endpoint],
        i: usize,
    ) -> Result<()> {
        let conflist = self.conflist(&endpoints[i])?;
        let rt = self.runtime_conf(dir.id(), netns, &endpoints[i]);
        endpoints[i].state = EndpointState::Pending;
        table.save(endpoints)?;

        let result = self.cni.add(&conflist, &rt).await?;
        endpoints[i].addresses = cni::result_addresses(&result);
        endpoints[i].result = Some(result);
        endpoints[i].state = EndpointState::Attached;
        table.save(endpoints)
    }

    /// DEL the attached endpoints in reverse; failures are logged and the
    /// rest still run. A pending endpoint is left for the next reconcile.
    async fn roll_back(&self, dir: &ContainerDir, netns: &PathBuf, endpoints: &mut [Endpoint]) {
        for endpoint in endpoints.iter_mut().rev() {
            if endpoint.state != EndpointState::Attached {
                continue;
            }
            match self.conflist(endpoint) {
                Ok(conflist) => {
                    let rt = self.runtime_conf(dir.id(), netns, endpoint);
                    if let Err(e) = self.cni.del(&conflist, &rt, endpoint.result.as_ref()).await {
                        warn!("rollback DEL of {} failed: {}", endpoint.name, e);
                    }
                }
                Err(e) => warn!("cannot roll back {}: {}", endpoint.name, e),
            }
            endpoint.state = EndpointState::Allocated;
            endpoint.result = None;
            endpoint.addresses.clear();
        }
    }

    /// CNI DEL in reverse order; every endpoint ends `allocated` even when a
    /// plugin fails
    pub async fn detach(&self, dir: &ContainerDir, netns: PathBuf) -> Result<()> {
        let table = EndpointTable::new(dir);
        let mut endpoints = table.load()?;
        for endpoint in endpoints.iter_mut().rev() {
            if !endpoint.needs_del() {
                continue;
            }
            match self.conflist(endpoint) {
                Ok(conflist) => {
                    let rt = self.runtime_conf(dir.id(), &netns, endpoint);
                    if let Err(e) = self.cni.del(&conflist, &rt, endpoint.result.as_ref()).await {
                        warn!("DEL of {} failed: {}", endpoint.name, e);
                    }
                }
                Err(e) => warn!("cannot detach {}: {}", endpoint.name, e),
            }
            endpoint.state = EndpointState::Allocated;
            endpoint.result = None;
            endpoint.addresses.clear();
        }
        table.save(&endpoints)
    }

    /// Forget a removed container's endpoints
    pub fn release(&self, dir: &ContainerDir) -> Result<()> {
        EndpointTable::new(dir).remove()
    }

    /// IDs of containers with an endpoint on `network`
    pub fn attached_containers(&self, network: &NetworkConfig) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(self.store.containers_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().into_owned();
            let dir = self.store.container(&id);
            let endpoints = EndpointTable::new(&dir).load()?;
            if endpoints
                .iter()
                .any(|e| e.network_id == network.id || e.network == network.name)
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NameStore;
    use tempfile::tempdir;

    #[test]
    fn test_mode_parse() {
        let s = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            NetworkMode::parse(&[]).unwrap(),
            NetworkMode::Named(vec!["bridge".into()])
        );
        assert_eq!(NetworkMode::parse(&s(&["host"])).unwrap(), NetworkMode::Host);
        assert_eq!(
            NetworkMode::parse(&s(&["container:web"])).unwrap(),
            NetworkMode::Container("web".into())
        );
        assert_eq!(
            NetworkMode::parse(&s(&["n1,n2", "n1"])).unwrap(),
            NetworkMode::Named(vec!["n1".into(), "n2".into()])
        );
        assert!(NetworkMode::parse(&s(&["host", "n1"])).is_err());
        assert!(NetworkMode::parse(&s(&["container:"])).is_err());
    }

    #[test]
    fn test_parse_publish() {
        let p = parse_publish("8080:80").unwrap();
        assert_eq!((p[0].host_port, p[0].container_port), (8080, 80));
        assert_eq!(p[0].protocol, "tcp");

        let p = parse_publish("127.0.0.1:5353:53/udp").unwrap();
        assert_eq!(p[0].host_ip, "127.0.0.1");
        assert_eq!(p[0].protocol, "udp");

        let p = parse_publish("80").unwrap();
        assert_eq!(p[0].host_port, 0);

        let p = parse_publish("8000-8002:90-92").unwrap();
        assert_eq!(p.len(), 3);
        assert_eq!((p[2].host_port, p[2].container_port), (8002, 92));

        assert!(parse_publish("8000-8001:80").is_err());
        assert!(parse_publish("80/icmp").is_err());
        assert!(parse_publish("nope:80").is_err());
    }

    #[test]
    fn test_resolv_conf_drops_loopback() {
        let host = "nameserver 127.0.0.53\nsearch corp.example\noptions edns0\n";
        let out = resolv_conf(host, &[], &[], &[]);
        assert_eq!(
            out,
            "search corp.example\nnameserver 8.8.8.8\nnameserver 8.8.4.4\noptions edns0\n"
        );

        let out = resolv_conf(host, &["1.1.1.1".into()], &["svc.local".into()], &[]);
        assert!(out.contains("nameserver 1.1.1.1\n"));
        assert!(out.starts_with("search svc.local\n"));
    }

    fn coordinator(temp: &std::path::Path) -> NetworkCoordinator {
        let store = DataStore::with_host(temp.join("root"), "test", "default");
        let networks = NetworkStore::new(
            temp.join("net.d"),
            "default",
            NameStore::new(temp.join("names")),
        );
        NetworkCoordinator::with_parts(
            networks,
            CniRunner::new(vec![temp.join("bin")]),
            store,
        )
    }

    fn install_plugins(temp: &std::path::Path, fail_on: &[&str]) -> PathBuf {
        let bin = temp.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let log = temp.join("cni.log");
        for plugin in ["bridge", "portmap", "firewall", "tuning"] {
            cni::tests::fake_plugin(&bin, plugin, &log, fail_on, "10.4.1.2");
        }
        log
    }

    fn bridge_calls(log: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .filter(|l| l.ends_with(" bridge"))
            .map(|l| l.trim_end_matches(" bridge").to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_add_failure_rolls_back() {
        let temp = tempdir().unwrap();
        let log = install_plugins(temp.path(), &["b"]);
        let coord = coordinator(temp.path());
        for name in ["a", "b", "c"] {
            coord
                .networks()
                .create(NetworkCreate {
                    name: name.into(),
                    ..Default::default()
                })
                .unwrap();
        }
        let dir = coord.store.container("c0ffee");
        dir.create().unwrap();
        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        coord.allocate(&dir, &names, &[]).unwrap();

        let err = coord
            .attach(&dir, PathBuf::from("/proc/1/ns/net"))
            .await
            .unwrap_err();
        assert!(matches!(err, CtlError::Cni { .. }));
        assert_eq!(bridge_calls(&log), vec!["ADD a", "ADD b", "DEL a"]);

        let endpoints = EndpointTable::new(&dir).load().unwrap();
        assert_eq!(endpoints[0].state, EndpointState::Allocated);
        assert_eq!(endpoints[1].state, EndpointState::Pending);
    }

    #[tokio::test]
    async fn test_vanished_network_rolls_back_earlier_adds() {
        let temp = tempdir().unwrap();
        let log = install_plugins(temp.path(), &[]);
        let coord = coordinator(temp.path());
        for name in ["a", "b"] {
            coord
                .networks()
                .create(NetworkCreate {
                    name: name.into(),
                    ..Default::default()
                })
                .unwrap();
        }
        let dir = coord.store.container("c0ffee");
        dir.create().unwrap();
        let names: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        coord.allocate(&dir, &names, &[]).unwrap();
        let gone = coord.networks().get("b").unwrap().unwrap();
        std::fs::remove_file(&gone.file).unwrap();

        let err = coord
            .attach(&dir, PathBuf::from("/proc/1/ns/net"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(bridge_calls(&log), vec!["ADD a", "DEL a"]);
        let endpoints = EndpointTable::new(&dir).load().unwrap();
        assert!(endpoints.iter().all(|e| e.state == EndpointState::Allocated));
    }

    #[tokio::test]
    async fn test_attach_detach_net_zero() {
        let temp = tempdir().unwrap();
        let log = install_plugins(temp.path(), &[]);
        let coord = coordinator(temp.path());
        coord
            .networks()
            .create(NetworkCreate {
                name: "n1".into(),
                ..Default::default()
            })
            .unwrap();
        let dir = coord.store.container("c0ffee");
        dir.create().unwrap();
        coord.allocate(&dir, &["n1".to_string()], &[]).unwrap();
        let before = EndpointTable::new(&dir).load().unwrap();

        let addresses = coord
            .attach(&dir, PathBuf::from("/proc/1/ns/net"))
            .await
            .unwrap();
        assert_eq!(addresses, vec![("n1".to_string(), "10.4.1.2".to_string())]);

        // A second start reconciles with DEL before ADD.
        coord
            .attach(&dir, PathBuf::from("/proc/1/ns/net"))
            .await
            .unwrap();
        coord.detach(&dir, PathBuf::new()).await.unwrap();

        assert_eq!(EndpointTable::new(&dir).load().unwrap(), before);
        assert_eq!(
            bridge_calls(&log),
            vec!["ADD n1", "DEL n1", "ADD n1", "DEL n1"]
        );
        assert_eq!(
            coord
                .attached_containers(&coord.networks().get("n1").unwrap().unwrap())
                .unwrap(),
            vec!["c0ffee".to_string()]
        );
    }
}
