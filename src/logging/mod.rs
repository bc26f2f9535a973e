//! Container log drivers
//!
//! Detached containers hand their stdout/stderr to a logger process the
//! runtime spawns (`binary://` URI pointing back at runectl). The logger
//! reads `log-config.json` from the container directory and writes through
//! the configured driver. `logs` reads the result back.

pub mod driver;
pub mod journald;
pub mod json_file;
pub mod reader;

pub use json_file::{JsonFileWriter, LogEntry};
pub use reader::{LogsOptions, parse_timestamp};

use crate::error::{CtlError, Result};
use crate::store::{read_json, write_json, ContainerDir};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Argument the runtime passes to the logger binary
pub const LOGGING_ENTRY: &str = "_RUNECTL_INTERNAL_LOGGING";

pub const DEFAULT_MAX_SIZE: u64 = 20 * 1024 * 1024;
pub const DEFAULT_MAX_FILE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogDriver {
    #[default]
    JsonFile,
    Journald,
    None,
}

impl std::str::FromStr for LogDriver {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json-file" => Ok(LogDriver::JsonFile),
            "journald" => Ok(LogDriver::Journald),
            "none" => Ok(LogDriver::None),
            other => Err(CtlError::usage(format!(
                "unknown log driver {:?} (expected json-file, journald or none)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for LogDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogDriver::JsonFile => write!(f, "json-file"),
            LogDriver::Journald => write!(f, "journald"),
            LogDriver::None => write!(f, "none"),
        }
    }
}

/// Persisted per-container logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LogConfig {
    pub driver: LogDriver,
    #[serde(default)]
    pub opts: BTreeMap<String, String>,
    /// Container name and image, for journald fields
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
}

impl LogConfig {
    /// Build from `--log-driver` / `--log-opt key=value`
    pub fn parse(driver: Option<&str>, opts: &[String]) -> Result<Self> {
        let driver = driver.map(str::parse).transpose()?.unwrap_or_default();
        let mut parsed = BTreeMap::new();
        for opt in opts {
            let (key, value) = opt.split_once('=').ok_or_else(|| {
                CtlError::usage(format!("invalid log-opt {:?}, expected key=value", opt))
            })?;
            let allowed: &[&str] = match driver {
                LogDriver::JsonFile => &["max-size", "max-file", "compress"],
                LogDriver::Journald => &["tag"],
                LogDriver::None => &[],
            };
            if !allowed.contains(&key) {
                return Err(CtlError::usage(format!(
                    "unknown log opt {:?} for {} log driver",
                    key, driver
                )));
            }
            parsed.insert(key.to_string(), value.to_string());
        }
        let config = Self {
            driver,
            opts: parsed,
            ..Default::default()
        };
        config.max_size()?;
        config.max_file()?;
        Ok(config)
    }

    /// Rotation threshold in bytes; 0 disables rotation
    pub fn max_size(&self) -> Result<u64> {
        match self.opts.get("max-size") {
            Some(size) if size == "-1" => Ok(0),
            Some(size) => Ok(crate::spec::resources::parse_size(size)? as u64),
            None => Ok(DEFAULT_MAX_SIZE),
        }
    }

    pub fn max_file(&self) -> Result<u32> {
        match self.opts.get("max-file") {
            Some(n) => match n.parse::<u32>() {
                Ok(n) if n >= 1 => Ok(n),
                _ => Err(CtlError::usage(format!("invalid max-file {:?}", n))),
            },
            None => Ok(DEFAULT_MAX_FILE),
        }
    }

    pub fn compress(&self) -> bool {
        self.opts.get("compress").map(|c| c != "false").unwrap_or(true)
    }

    pub fn save(&self, dir: &ContainerDir) -> Result<()> {
        write_json(&dir.log_config_path(), self)
    }

    pub fn load(dir: &ContainerDir) -> Result<Self> {
        Ok(read_json(&dir.log_config_path())?.unwrap_or_default())
    }
}

/// `binary://` URI that makes the runtime spawn runectl as the logger
pub fn logger_uri(exe: &Path, data_root: &Path) -> String {
    format!(
        "binary://{}?{}={}",
        exe.display(),
        LOGGING_ENTRY,
        data_root.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_config_parse() {
        let config = LogConfig::parse(
            Some("json-file"),
            &["max-size=1k".to_string(), "max-file=3".to_string()],
        )
        .unwrap();
        assert_eq!(config.max_size().unwrap(), 1024);
        assert_eq!(config.max_file().unwrap(), 3);
        assert!(config.compress());

        assert!(LogConfig::parse(Some("syslog"), &[]).is_err());
        assert!(LogConfig::parse(None, &["tag=x".to_string()]).is_err());
        assert!(LogConfig::parse(None, &["max-file=0".to_string()]).is_err());
        let journald = LogConfig::parse(Some("journald"), &["tag=web".to_string()]).unwrap();
        assert_eq!(journald.driver, LogDriver::Journald);
    }

    #[test]
    fn test_log_config_persisted() {
        let temp = tempdir().unwrap();
        let dir = ContainerDir::new(temp.path().join("c1"), "c1");
        dir.create().unwrap();
        assert_eq!(LogConfig::load(&dir).unwrap(), LogConfig::default());

        let config = LogConfig {
            name: "web".into(),
            ..LogConfig::parse(Some("journald"), &[]).unwrap()
        };
        config.save(&dir).unwrap();
        assert_eq!(LogConfig::load(&dir).unwrap(), config);
        assert_eq!(
            logger_uri(Path::new("/usr/bin/runectl"), Path::new("/var/lib/runectl")),
            "binary:///usr/bin/runectl?_RUNECTL_INTERNAL_LOGGING=/var/lib/runectl"
        );
    }
}
