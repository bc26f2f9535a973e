//! Global configuration
//!
//! Values are merged with the precedence flag > environment > config file >
//! built-in default. clap resolves the first two (every global flag carries an
//! `env`), this module merges the result over `runectl.toml`.

use crate::error::{CtlError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable naming an alternative config file
pub const CONFIG_ENV: &str = "RUNECTL_TOML";

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_ADDRESS: &str = "unix:///run/runectl/runtime.sock";
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";
pub const DEFAULT_CNI_PATH: &str = "/opt/cni/bin";
pub const DEFAULT_BUILDKIT_HOST: &str = "unix:///run/buildkit/buildkitd.sock";

/// Cgroup driver handed to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupManager {
    Cgroupfs,
    Systemd,
    None,
}

impl FromStr for CgroupManager {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cgroupfs" => Ok(CgroupManager::Cgroupfs),
            "systemd" => Ok(CgroupManager::Systemd),
            "none" => Ok(CgroupManager::None),
            other => Err(CtlError::InvalidConfig(format!(
                "unknown cgroup manager {:?} (expected cgroupfs, systemd or none)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CgroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CgroupManager::Cgroupfs => write!(f, "cgroupfs"),
            CgroupManager::Systemd => write!(f, "systemd"),
            CgroupManager::None => write!(f, "none"),
        }
    }
}

/// Contents of `runectl.toml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub debug: Option<bool>,
    pub address: Option<String>,
    pub namespace: Option<String>,
    pub snapshotter: Option<String>,
    pub cgroup_manager: Option<CgroupManager>,
    pub data_root: Option<PathBuf>,
    pub hosts_dir: Option<Vec<PathBuf>>,
    pub insecure_registry: Option<Vec<String>>,
    pub cni_path: Option<PathBuf>,
    pub cni_netconfpath: Option<PathBuf>,
    pub buildkit_host: Option<String>,
}

impl ConfigFile {
    /// Load the config file; a missing file yields the empty config
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Location of the config file for this user
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        if is_rootless() {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(".config"))
                .join("runectl")
                .join("runectl.toml")
        } else {
            PathBuf::from("/etc/runectl/runectl.toml")
        }
    }
}

/// Global flag values after clap has applied flag-over-env precedence
#[derive(Debug, Clone, Default)]
pub struct GlobalFlags {
    pub debug: Option<bool>,
    pub address: Option<String>,
    pub namespace: Option<String>,
    pub snapshotter: Option<String>,
    pub cgroup_manager: Option<String>,
    pub data_root: Option<PathBuf>,
    pub hosts_dir: Vec<PathBuf>,
    pub insecure_registry: Vec<String>,
    pub cni_path: Option<PathBuf>,
    pub cni_netconfpath: Option<PathBuf>,
    pub buildkit_host: Option<String>,
}

/// Fully resolved global configuration
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub debug: bool,
    pub address: String,
    pub namespace: String,
    pub snapshotter: String,
    pub cgroup_manager: CgroupManager,
    pub data_root: PathBuf,
    pub hosts_dir: Vec<PathBuf>,
    pub insecure_registries: Vec<String>,
    pub cni_path: PathBuf,
    pub cni_netconfpath: PathBuf,
    pub buildkit_host: String,
    pub rootless: bool,
}

impl GlobalConfig {
    /// Merge flags over the config file over the defaults
    pub fn resolve(flags: GlobalFlags, file: ConfigFile) -> Result<Self> {
        let rootless = is_rootless();

        let namespace = flags
            .namespace
            .or(file.namespace)
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        if namespace.is_empty() || namespace.contains('/') || namespace.contains("..") {
            return Err(CtlError::InvalidConfig(format!(
                "invalid namespace {:?}",
                namespace
            )));
        }

        let cgroup_manager = match flags.cgroup_manager {
            Some(value) => value.parse()?,
            None => file
                .cgroup_manager
                .unwrap_or_else(|| default_cgroup_manager(rootless)),
        };

        let data_root = flags
            .data_root
            .or(file.data_root)
            .unwrap_or_else(|| default_data_root(rootless));

        let cni_netconfpath = flags
            .cni_netconfpath
            .or(file.cni_netconfpath)
            .unwrap_or_else(|| data_root.join("cni").join("net.d"));

        let hosts_dir = if !flags.hosts_dir.is_empty() {
            flags.hosts_dir
        } else {
            file.hosts_dir.unwrap_or_else(|| {
                vec![
                    PathBuf::from("/etc/runectl/certs.d"),
                    PathBuf::from("/etc/docker/certs.d"),
                ]
            })
        };

        let insecure_registries = if !flags.insecure_registry.is_empty() {
            flags.insecure_registry
        } else {
            file.insecure_registry.unwrap_or_default()
        };

        Ok(Self {
            debug: flags.debug.or(file.debug).unwrap_or(false),
            address: flags
                .address
                .or(file.address)
                .unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
            namespace,
            snapshotter: flags
                .snapshotter
                .or(file.snapshotter)
                .unwrap_or_else(|| DEFAULT_SNAPSHOTTER.to_string()),
            cgroup_manager,
            data_root,
            hosts_dir,
            insecure_registries,
            cni_path: flags
                .cni_path
                .or(file.cni_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CNI_PATH)),
            cni_netconfpath,
            buildkit_host: flags
                .buildkit_host
                .or(file.buildkit_host)
                .unwrap_or_else(|| DEFAULT_BUILDKIT_HOST.to_string()),
            rootless,
        })
    }

    /// Global flags that reproduce this configuration in a child invocation
    pub fn child_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--data-root={}", self.data_root.display()),
            format!("--namespace={}", self.namespace),
            format!("--address={}", self.address),
            format!("--cni-path={}", self.cni_path.display()),
            format!("--cni-netconfpath={}", self.cni_netconfpath.display()),
        ];
        if self.debug {
            args.push("--debug".to_string());
        }
        args
    }
}

/// Whether we run without root privileges
pub fn is_rootless() -> bool {
    !nix::unistd::geteuid().is_root()
}

fn default_data_root(rootless: bool) -> PathBuf {
    if rootless {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("runectl")
    } else {
        PathBuf::from("/var/lib/runectl")
    }
}

fn default_cgroup_manager(rootless: bool) -> CgroupManager {
    if !rootless && Path::new("/run/systemd/system").exists() {
        CgroupManager::Systemd
    } else {
        CgroupManager::Cgroupfs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_beats_file() {
        let file = ConfigFile::parse(
            r#"
namespace = "from-file"
snapshotter = "native"
data_root = "/srv/runectl"
"#,
        )
        .unwrap();
        let flags = GlobalFlags {
            namespace: Some("from-flag".to_string()),
            ..Default::default()
        };
        let config = GlobalConfig::resolve(flags, file).unwrap();
        assert_eq!(config.namespace, "from-flag");
        assert_eq!(config.snapshotter, "native");
        assert_eq!(config.data_root, PathBuf::from("/srv/runectl"));
        assert_eq!(
            config.cni_netconfpath,
            PathBuf::from("/srv/runectl/cni/net.d")
        );
    }

    #[test]
    fn test_defaults_apply() {
        let config = GlobalConfig::resolve(GlobalFlags::default(), ConfigFile::default()).unwrap();
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.address, DEFAULT_ADDRESS);
        assert_eq!(config.snapshotter, DEFAULT_SNAPSHOTTER);
        assert_eq!(config.cni_path, PathBuf::from(DEFAULT_CNI_PATH));
        assert!(!config.debug);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(ConfigFile::parse("nmespace = \"typo\"").is_err());
    }

    #[test]
    fn test_invalid_cgroup_manager() {
        let flags = GlobalFlags {
            cgroup_manager: Some("cgroupv3".to_string()),
            ..Default::default()
        };
        let err = GlobalConfig::resolve(flags, ConfigFile::default()).unwrap_err();
        assert_eq!(err.exit_code(), 125);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let file = ConfigFile::load(&temp.path().join("absent.toml")).unwrap();
        assert!(file.namespace.is_none());
    }
}
