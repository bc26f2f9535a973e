//! Compose file model
//!
//! Only the keys the orchestrator acts on are modelled; other keys are
//! accepted and ignored so that real-world files still load.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A parsed compose file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Obsolete, kept so old files parse
    #[serde(default)]
    pub version: Option<String>,
    /// Project name
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub networks: BTreeMap<String, Option<NetworkConfig>>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub build: Option<BuildConfig>,
    #[serde(default)]
    pub command: Option<CommandConfig>,
    #[serde(default)]
    pub entrypoint: Option<CommandConfig>,
    /// Fixed container name; forbids more than one replica
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    #[serde(default)]
    pub env_file: Option<EnvFileConfig>,
    #[serde(default)]
    pub ports: Option<Vec<PortConfig>>,
    #[serde(default)]
    pub volumes: Option<Vec<VolumeMount>>,
    #[serde(default)]
    pub tmpfs: Option<StringOrList>,
    #[serde(default)]
    pub networks: Option<NetworksConfig>,
    /// `host`, `none`, `service:<name>` or `container:<name>`
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub depends_on: Option<DependsOnConfig>,
    #[serde(default)]
    pub deploy: Option<DeployConfig>,
    /// Replica count, overridden by `deploy.replicas`
    #[serde(default)]
    pub scale: Option<u32>,
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub restart: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub privileged: Option<bool>,
    #[serde(default)]
    pub read_only: Option<bool>,
    #[serde(default)]
    pub stdin_open: Option<bool>,
    #[serde(default)]
    pub tty: Option<bool>,
    #[serde(default)]
    pub stop_signal: Option<String>,
    /// Duration such as `10s` or `1m30s`
    #[serde(default)]
    pub stop_grace_period: Option<String>,
    #[serde(default)]
    pub sysctls: Option<LabelsConfig>,
    #[serde(default)]
    pub extra_hosts: Option<Vec<String>>,
    #[serde(default)]
    pub dns: Option<StringOrList>,
    #[serde(default)]
    pub dns_search: Option<StringOrList>,
    #[serde(default)]
    pub cap_add: Option<Vec<String>>,
    #[serde(default)]
    pub cap_drop: Option<Vec<String>>,
    #[serde(default)]
    pub security_opt: Option<Vec<String>>,
    #[serde(default)]
    pub devices: Option<Vec<String>>,
    #[serde(default)]
    pub pull_policy: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub mem_limit: Option<String>,
    #[serde(default)]
    pub pids_limit: Option<i64>,
}

impl ServiceConfig {
    /// Services this one must start after
    pub fn dependencies(&self) -> Vec<String> {
        match &self.depends_on {
            None => Vec::new(),
            Some(DependsOnConfig::Array(list)) => list.clone(),
            Some(DependsOnConfig::Map(map)) => map.keys().cloned().collect(),
        }
    }

    /// Network keys this service joins; `default` when none are given
    pub fn network_keys(&self) -> Vec<String> {
        match &self.networks {
            None => vec!["default".to_string()],
            Some(NetworksConfig::Array(list)) => list.clone(),
            Some(NetworksConfig::Map(map)) => map.keys().cloned().collect(),
        }
    }

    pub fn replicas(&self) -> u32 {
        self.deploy
            .as_ref()
            .and_then(|d| d.replicas)
            .or(self.scale)
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Context path
    Simple(String),
    Full(BuildConfigFull),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub args: Option<LabelsConfig>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    #[serde(default)]
    pub no_cache: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Split like a shell would, without running one
    Shell(String),
    Exec(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, Option<ScalarValue>>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Single(String),
    List(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::Single(s) => vec![s.clone()],
            StringOrList::List(list) => list.clone(),
        }
    }
}

/// Alias kept for the compose key name
pub type EnvFileConfig = StringOrList;

/// YAML scalars that compose treats as strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::String(s) => write!(f, "{}", s),
            ScalarValue::Integer(n) => write!(f, "{}", n),
            ScalarValue::Float(n) => write!(f, "{}", n),
            ScalarValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    Short(ScalarValue),
    Long(PortConfigLong),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    pub target: u16,
    #[serde(default)]
    pub published: Option<ScalarValue>,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

impl PortConfig {
    /// The `-p` form of this entry
    pub fn to_publish(&self) -> String {
        match self {
            PortConfig::Short(value) => value.to_string(),
            PortConfig::Long(long) => {
                let mut out = String::new();
                if let Some(ip) = &long.host_ip {
                    out.push_str(ip);
                    out.push(':');
                }
                if let Some(published) = &long.published {
                    out.push_str(&published.to_string());
                    out.push(':');
                } else if long.host_ip.is_some() {
                    out.push(':');
                }
                out.push_str(&long.target.to_string());
                if let Some(proto) = &long.protocol {
                    out.push('/');
                    out.push_str(proto);
                }
                out
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    Short(String),
    Long(VolumeMountLong),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    #[serde(rename = "type", default)]
    pub mount_type: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub target: String,
    #[serde(default)]
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    #[serde(default)]
    pub aliases: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, DependsOnCondition>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Only `service_started` semantics are honoured
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default)]
    pub replicas: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, ScalarValue>),
}

impl LabelsConfig {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        match self {
            LabelsConfig::Array(list) => list
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
            LabelsConfig::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub options: Option<BTreeMap<String, ScalarValue>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub driver_opts: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub ipam: Option<IpamConfig>,
    #[serde(default)]
    pub external: Option<bool>,
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    /// Name outside the project namespace
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamConfig {
    #[serde(default)]
    pub config: Option<Vec<IpamPoolConfig>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamPoolConfig {
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub ip_range: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub external: Option<bool>,
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    #[serde(default)]
    pub name: Option<String>,
}
