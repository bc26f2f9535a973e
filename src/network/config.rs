//! Network configuration
//!
//! Networks are stored as CNI configuration lists,
//! `<netconfpath>[/<namespace>]/runectl-<name>.conflist`, with the network
//! ID and labels carried in `runectlID` / `runectlLabels` extension keys.

use crate::error::{CtlError, ObjectKind, Result};
use crate::store::lock::with_dir_lock;
use crate::store::{write_atomic, NameStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Name of the network used when `--net` is not given
pub const DEFAULT_NETWORK: &str = "bridge";
/// Bridge device of the default network
pub const DEFAULT_BRIDGE: &str = "runectl0";
/// Subnet of the default network
pub const DEFAULT_SUBNET: &str = "10.4.0.0/24";

const CNI_VERSION: &str = "1.0.0";
const CONFLIST_PREFIX: &str = "runectl-";
const CONFLIST_SUFFIX: &str = ".conflist";

/// Network driver types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriver {
    /// Bridge network (default)
    #[default]
    Bridge,
    /// Macvlan network
    Macvlan,
    /// IPvlan network
    Ipvlan,
    /// No networking
    None,
}

impl std::fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkDriver::Bridge => write!(f, "bridge"),
            NetworkDriver::Macvlan => write!(f, "macvlan"),
            NetworkDriver::Ipvlan => write!(f, "ipvlan"),
            NetworkDriver::None => write!(f, "none"),
        }
    }
}

impl FromStr for NetworkDriver {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bridge" => Ok(NetworkDriver::Bridge),
            "macvlan" => Ok(NetworkDriver::Macvlan),
            "ipvlan" => Ok(NetworkDriver::Ipvlan),
            "none" | "null" => Ok(NetworkDriver::None),
            other => Err(CtlError::usage(format!("unsupported network driver {:?}", other))),
        }
    }
}

/// An IPv4 CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Subnet {
    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix as u32)
        }
    }

    /// Network address
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.network())
    }

    pub fn overlaps(&self, other: &Subnet) -> bool {
        self.contains(other.network()) || other.contains(self.network())
    }

    /// First usable address, conventionally the gateway
    pub fn first_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()).saturating_add(1))
    }
}

impl FromStr for Subnet {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CtlError::usage(format!("invalid subnet {:?}", s));
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        Ok(Self { addr, prefix })
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

/// IPAM pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamPool {
    /// Subnet in CIDR format
    pub subnet: String,
    /// Gateway address
    pub gateway: Option<String>,
    /// Allocation range in CIDR format
    pub ip_range: Option<String>,
}

impl IpamPool {
    pub fn new(subnet: &str) -> Self {
        Self {
            subnet: subnet.to_string(),
            gateway: None,
            ip_range: None,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network ID
    pub id: String,
    /// Network name
    pub name: String,
    /// Network driver
    pub driver: NetworkDriver,
    /// IPAM pools
    pub ipam: Vec<IpamPool>,
    /// Driver options (`parent`, `mode`, `mtu`, `bridge`)
    pub options: BTreeMap<String, String>,
    /// Network labels
    pub labels: BTreeMap<String, String>,
    /// Path of the backing conflist
    #[serde(skip)]
    pub file: PathBuf,
    /// Created timestamp
    pub created: DateTime<Utc>,
}

impl NetworkConfig {
    /// Create a new network configuration
    pub fn new(name: &str) -> Self {
        let id = format!("{:x}", Sha256::digest(Uuid::new_v4().as_bytes()));
        Self {
            id,
            name: name.to_string(),
            driver: NetworkDriver::default(),
            ipam: Vec::new(),
            options: BTreeMap::new(),
            labels: BTreeMap::new(),
            file: PathBuf::new(),
            created: Utc::now(),
        }
    }

    /// Set network driver
    pub fn driver(mut self, driver: NetworkDriver) -> Self {
        self.driver = driver;
        self
    }

    /// Add an IPAM pool
    pub fn subnet(mut self, subnet: &str) -> Self {
        self.ipam.push(IpamPool::new(subnet));
        self
    }

    /// Set the gateway of the last pool
    pub fn gateway(mut self, gateway: &str) -> Self {
        if let Some(pool) = self.ipam.last_mut() {
            pool.gateway = Some(gateway.to_string());
        }
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    /// Parsed subnets of every pool
    pub fn subnets(&self) -> Result<Vec<Subnet>> {
        self.ipam.iter().map(|p| p.subnet.parse()).collect()
    }

    /// Subnets must not overlap; gateways and ranges lie inside their subnet
    pub fn validate(&self) -> Result<()> {
        let subnets = self.subnets()?;
        for (i, a) in subnets.iter().enumerate() {
            for b in &subnets[i + 1..] {
                if a.overlaps(b) {
                    return Err(CtlError::usage(format!(
                        "subnets {} and {} of network {} overlap",
                        a, b, self.name
                    )));
                }
            }
        }
        for (pool, subnet) in self.ipam.iter().zip(&subnets) {
            if let Some(gateway) = &pool.gateway {
                let ip: Ipv4Addr = gateway
                    .parse()
                    .map_err(|_| CtlError::usage(format!("invalid gateway {:?}", gateway)))?;
                if !subnet.contains(ip) {
                    return Err(CtlError::usage(format!(
                        "gateway {} is not in subnet {}",
                        gateway, subnet
                    )));
                }
            }
            if let Some(range) = &pool.ip_range {
                let range: Subnet = range.parse()?;
                if !subnet.contains(range.network()) || range.prefix < subnet.prefix {
                    return Err(CtlError::usage(format!(
                        "ip range {} is not in subnet {}",
                        range, subnet
                    )));
                }
            }
        }
        if matches!(self.driver, NetworkDriver::Macvlan | NetworkDriver::Ipvlan)
            && !self.options.contains_key("parent")
        {
            return Err(CtlError::usage(format!(
                "{} networks need a parent interface (-o parent=<iface>)",
                self.driver
            )));
        }
        Ok(())
    }

    /// Bridge device name for bridge networks
    pub fn bridge_name(&self) -> String {
        if let Some(bridge) = self.options.get("bridge") {
            return bridge.clone();
        }
        if self.name == DEFAULT_NETWORK {
            DEFAULT_BRIDGE.to_string()
        } else {
            format!("br-{}", &self.id[..12.min(self.id.len())])
        }
    }

    fn ipam_value(&self) -> Value {
        let ranges: Vec<Value> = self
            .ipam
            .iter()
            .map(|pool| {
                let mut range = json!({ "subnet": pool.subnet });
                if let Some(gateway) = &pool.gateway {
                    range["gateway"] = json!(gateway);
                }
                if let Some(ip_range) = &pool.ip_range {
                    range["ipRange"] = json!(ip_range);
                }
                json!([range])
            })
            .collect();
        json!({
            "type": "host-local",
            "ranges": ranges,
            "routes": [{ "dst": "0.0.0.0/0" }],
        })
    }

    /// The CNI configuration list for this network
    pub fn conflist(&self) -> Value {
        let mtu = self
            .options
            .get("mtu")
            .and_then(|m| m.parse::<u32>().ok());
        let mut main = match self.driver {
            NetworkDriver::Bridge => json!({
                "type": "bridge",
                "bridge": self.bridge_name(),
                "isGateway": true,
                "ipMasq": true,
                "hairpinMode": true,
                "ipam": self.ipam_value(),
            }),
            NetworkDriver::Macvlan => json!({
                "type": "macvlan",
                "master": self.options.get("parent"),
                "mode": self.options.get("mode").map(String::as_str).unwrap_or("bridge"),
                "ipam": self.ipam_value(),
            }),
            NetworkDriver::Ipvlan => json!({
                "type": "ipvlan",
                "master": self.options.get("parent"),
                "mode": self.options.get("mode").map(String::as_str).unwrap_or("l2"),
                "ipam": self.ipam_value(),
            }),
            NetworkDriver::None => json!({ "type": "loopback" }),
        };
        if let Some(mtu) = mtu {
            main["mtu"] = json!(mtu);
        }

        let mut plugins = vec![main];
        if self.driver == NetworkDriver::Bridge {
            plugins.push(json!({ "type": "portmap", "capabilities": { "portMappings": true } }));
            plugins.push(json!({ "type": "firewall" }));
            plugins.push(json!({ "type": "tuning" }));
        }

        json!({
            "cniVersion": CNI_VERSION,
            "name": self.name,
            "runectlID": self.id,
            "runectlLabels": self.labels,
            "runectlOptions": self.options,
            "runectlCreated": self.created,
            "plugins": plugins,
        })
    }

    /// Rebuild a network from a stored conflist
    pub fn from_conflist(value: &Value, file: PathBuf) -> Result<Self> {
        let invalid = |what: &str| {
            CtlError::InvalidConfig(format!("{}: {}", file.display(), what))
        };
        let name = value["name"]
            .as_str()
            .ok_or_else(|| invalid("missing name"))?
            .to_string();
        let id = value["runectlID"]
            .as_str()
            .ok_or_else(|| invalid("missing runectlID"))?
            .to_string();
        let labels: BTreeMap<String, String> =
            serde_json::from_value(value["runectlLabels"].clone()).unwrap_or_default();
        let options: BTreeMap<String, String> =
            serde_json::from_value(value["runectlOptions"].clone()).unwrap_or_default();
        let created = serde_json::from_value(value["runectlCreated"].clone())
            .unwrap_or_else(|_| Utc::now());

        let main = value["plugins"]
            .get(0)
            .ok_or_else(|| invalid("empty plugin list"))?;
        let driver = match main["type"].as_str() {
            Some("macvlan") => NetworkDriver::Macvlan,
            Some("ipvlan") => NetworkDriver::Ipvlan,
            Some("bridge") => NetworkDriver::Bridge,
            _ => NetworkDriver::None,
        };
        let mut ipam = Vec::new();
        if let Some(ranges) = main["ipam"]["ranges"].as_array() {
            for set in ranges {
                for range in set.as_array().into_iter().flatten() {
                    if let Some(subnet) = range["subnet"].as_str() {
                        ipam.push(IpamPool {
                            subnet: subnet.to_string(),
                            gateway: range["gateway"].as_str().map(str::to_string),
                            ip_range: range["ipRange"].as_str().map(str::to_string),
                        });
                    }
                }
            }
        }

        Ok(Self {
            id,
            name,
            driver,
            ipam,
            options,
            labels,
            file,
            created,
        })
    }
}

/// Options for `network create`
#[derive(Debug, Clone, Default)]
pub struct NetworkCreate {
    pub name: String,
    pub driver: NetworkDriver,
    pub subnets: Vec<String>,
    pub gateway: Option<String>,
    pub ip_range: Option<String>,
    pub options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Conflist-backed network store for one namespace
#[derive(Debug, Clone)]
pub struct NetworkStore {
    dir: PathBuf,
    names: NameStore,
}

impl NetworkStore {
    pub fn new(netconfpath: PathBuf, namespace: &str, names: NameStore) -> Self {
        let dir = if namespace == crate::config::DEFAULT_NAMESPACE {
            netconfpath
        } else {
            netconfpath.join(namespace)
        };
        Self { dir, names }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", CONFLIST_PREFIX, name, CONFLIST_SUFFIX))
    }

    /// All networks, sorted by name
    pub fn list(&self) -> Result<Vec<NetworkConfig>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut networks = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_ours = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(CONFLIST_PREFIX) && n.ends_with(CONFLIST_SUFFIX))
                .unwrap_or(false);
            if !is_ours {
                continue;
            }
            let value: Value = serde_json::from_slice(&std::fs::read(&path)?)?;
            match NetworkConfig::from_conflist(&value, path.clone()) {
                Ok(network) => networks.push(network),
                Err(e) => tracing::warn!("skipping {}: {}", path.display(), e),
            }
        }
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(networks)
    }

    pub fn get(&self, name: &str) -> Result<Option<NetworkConfig>> {
        Ok(self.list()?.into_iter().find(|n| n.name == name))
    }

    /// Create a network; subnets default to the first free `10.4.N.0/24`
    pub fn create(&self, opts: NetworkCreate) -> Result<NetworkConfig> {
        crate::store::names::validate_name(&opts.name)?;
        if matches!(opts.name.as_str(), "host" | "none") {
            return Err(CtlError::usage(format!(
                "network name {:?} is reserved",
                opts.name
            )));
        }
        std::fs::create_dir_all(&self.dir)?;

        with_dir_lock(&self.dir, || {
            let existing = self.list()?;
            if let Some(network) = existing.iter().find(|n| n.name == opts.name) {
                return Err(CtlError::NameConflict {
                    kind: ObjectKind::Network,
                    name: opts.name.clone(),
                    id: network.id.clone(),
                });
            }

            let mut network = NetworkConfig::new(&opts.name).driver(opts.driver);
            network.options = opts.options.clone();
            network.labels = opts.labels.clone();
            if opts.name == DEFAULT_NETWORK {
                network.id = format!("{:x}", Sha256::digest(DEFAULT_NETWORK.as_bytes()));
            }

            if opts.subnets.is_empty() {
                if network.driver != NetworkDriver::None {
                    let subnet = if opts.name == DEFAULT_NETWORK {
                        DEFAULT_SUBNET.to_string()
                    } else {
                        next_free_subnet(&existing)?
                    };
                    network = network.subnet(&subnet);
                }
            } else {
                for subnet in &opts.subnets {
                    let parsed: Subnet = subnet.parse()?;
                    network = network.subnet(&parsed.to_string());
                }
            }
            if let Some(gateway) = &opts.gateway {
                if let Some(pool) = network.ipam.first_mut() {
                    pool.gateway = Some(gateway.clone());
                }
            }
            if let Some(range) = &opts.ip_range {
                if let Some(pool) = network.ipam.first_mut() {
                    pool.ip_range = Some(range.clone());
                }
            }
            if let Some(pool) = network.ipam.first_mut() {
                if pool.gateway.is_none() {
                    let subnet: Subnet = pool.subnet.parse()?;
                    pool.gateway = Some(subnet.first_host().to_string());
                }
            }
            network.validate()?;

            for other in &existing {
                for a in network.subnets()? {
                    if let Some(b) = other.subnets()?.into_iter().find(|b| a.overlaps(b)) {
                        return Err(CtlError::conflict(
                            format!("subnet {} overlaps network {} ({})", a, other.name, b),
                            "choose another --subnet",
                        ));
                    }
                }
            }

            self.names
                .reserve(ObjectKind::Network, &network.name, &network.id)?;
            network.file = self.path_for(&network.name);
            let data = serde_json::to_vec_pretty(&network.conflist())?;
            if let Err(e) = write_atomic(&network.file, &data) {
                let _ = self
                    .names
                    .release(ObjectKind::Network, &network.name, &network.id);
                return Err(e);
            }
            tracing::info!("created network {} ({})", network.name, network.id);
            Ok(network)
        })
    }

    /// The default `bridge` network, created on first use
    pub fn ensure_default(&self) -> Result<NetworkConfig> {
        if let Some(network) = self.get(DEFAULT_NETWORK)? {
            return Ok(network);
        }
        match self.create(NetworkCreate {
            name: DEFAULT_NETWORK.to_string(),
            ..Default::default()
        }) {
            Ok(network) => Ok(network),
            // Another client won the race.
            Err(CtlError::NameConflict { .. }) => self
                .get(DEFAULT_NETWORK)?
                .ok_or_else(|| CtlError::not_found(ObjectKind::Network, DEFAULT_NETWORK)),
            Err(e) => Err(e),
        }
    }

    /// Remove a network definition. Attachment checks belong to the caller.
    pub fn remove(&self, network: &NetworkConfig) -> Result<()> {
        if network.name == DEFAULT_NETWORK {
            return Err(CtlError::usage(format!(
                "{} is a pre-defined network and cannot be removed",
                DEFAULT_NETWORK
            )));
        }
        with_dir_lock(&self.dir, || {
            match std::fs::remove_file(self.path_for(&network.name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.names
                .release(ObjectKind::Network, &network.name, &network.id)
        })
    }
}

fn next_free_subnet(existing: &[NetworkConfig]) -> Result<String> {
    let used: Vec<Subnet> = existing
        .iter()
        .filter_map(|n| n.subnets().ok())
        .flatten()
        .collect();
    for n in 1..=255u8 {
        let candidate = Subnet {
            addr: Ipv4Addr::new(10, 4, n, 0),
            prefix: 24,
        };
        if !used.iter().any(|u| u.overlaps(&candidate)) {
            return Ok(candidate.to_string());
        }
    }
    Err(CtlError::conflict(
        "no free subnet left in 10.4.0.0/16",
        "pass --subnet explicitly",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(temp: &std::path::Path) -> NetworkStore {
        NetworkStore::new(
            temp.join("net.d"),
            "default",
            NameStore::new(temp.join("names")),
        )
    }

    #[test]
    fn test_network_config_builder() {
        let config = NetworkConfig::new("my-network")
            .driver(NetworkDriver::Macvlan)
            .subnet("10.0.0.0/24")
            .gateway("10.0.0.1")
            .option("parent", "eth0");

        assert_eq!(config.name, "my-network");
        assert_eq!(config.driver, NetworkDriver::Macvlan);
        assert!(config.validate().is_ok());
        assert_eq!(config.conflist()["plugins"][0]["master"], "eth0");
    }

    #[test]
    fn test_subnet_math() {
        let a: Subnet = "10.4.0.0/24".parse().unwrap();
        let b: Subnet = "10.4.0.128/25".parse().unwrap();
        let c: Subnet = "10.4.1.0/24".parse().unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.first_host(), Ipv4Addr::new(10, 4, 0, 1));
        assert!("10.4.0.0/33".parse::<Subnet>().is_err());
    }

    #[test]
    fn test_overlapping_pools_rejected() {
        let config = NetworkConfig::new("n")
            .subnet("192.168.0.0/16")
            .subnet("192.168.10.0/24");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_and_allocated_subnets() {
        let temp = tempdir().unwrap();
        let networks = store(temp.path());

        let default = networks.ensure_default().unwrap();
        assert_eq!(default.ipam[0].subnet, DEFAULT_SUBNET);
        assert_eq!(default.bridge_name(), DEFAULT_BRIDGE);

        let n1 = networks
            .create(NetworkCreate {
                name: "n1".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(n1.ipam[0].subnet, "10.4.1.0/24");
        assert_eq!(n1.ipam[0].gateway.as_deref(), Some("10.4.1.1"));

        let reloaded = networks.get("n1").unwrap().unwrap();
        assert_eq!(reloaded.id, n1.id);
        assert_eq!(reloaded.ipam, n1.ipam);

        let dup = networks.create(NetworkCreate {
            name: "n1".into(),
            ..Default::default()
        });
        assert!(matches!(dup, Err(CtlError::NameConflict { .. })));

        let clash = networks.create(NetworkCreate {
            name: "n2".into(),
            subnets: vec!["10.4.1.0/25".into()],
            ..Default::default()
        });
        assert!(matches!(clash, Err(CtlError::Conflict { .. })));

        networks.remove(&n1).unwrap();
        assert!(networks.get("n1").unwrap().is_none());
        assert!(networks.remove(&default).is_err());
    }
}
