//! Per-container state directory

use super::{read_json, write_atomic, write_json};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Last known start/exit of the container's init process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

/// `<root>/<host>/<namespace>/containers/<id>`
#[derive(Debug, Clone)]
pub struct ContainerDir {
    path: PathBuf,
    id: String,
}

impl ContainerDir {
    pub fn new(path: PathBuf, id: &str) -> Self {
        Self {
            path,
            id: id.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path)?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn hostname_path(&self) -> PathBuf {
        self.path.join("hostname")
    }

    pub fn resolv_conf_path(&self) -> PathBuf {
        self.path.join("resolv.conf")
    }

    pub fn endpoints_path(&self) -> PathBuf {
        self.path.join("endpoints.json")
    }

    pub fn log_config_path(&self) -> PathBuf {
        self.path.join("log-config.json")
    }

    /// json-file log of the container
    pub fn log_path(&self) -> PathBuf {
        self.path.join(format!("{}-json.log", self.id))
    }

    /// FIFO directory of one process (`init` or an exec ID)
    pub fn io_dir(&self, process: &str) -> PathBuf {
        self.path.join("io").join(process)
    }

    pub fn stop_signal(&self) -> Result<Option<String>> {
        self.read_value("stop-signal")
    }

    pub fn set_stop_signal(&self, signal: &str) -> Result<()> {
        write_atomic(&self.path.join("stop-signal"), signal.as_bytes())
    }

    pub fn restart_policy(&self) -> Result<Option<String>> {
        self.read_value("restart-policy")
    }

    pub fn set_restart_policy(&self, policy: &str) -> Result<()> {
        write_atomic(&self.path.join("restart-policy"), policy.as_bytes())
    }

    pub fn process_record(&self) -> Result<ProcessRecord> {
        Ok(read_json(&self.path.join("state.json"))?.unwrap_or_default())
    }

    pub fn save_process_record(&self, record: &ProcessRecord) -> Result<()> {
        write_json(&self.path.join("state.json"), record)
    }

    fn read_value(&self, name: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path.join(name)) {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_values_round_trip() {
        let temp = tempdir().unwrap();
        let dir = ContainerDir::new(temp.path().join("abc"), "abc");
        dir.create().unwrap();

        assert_eq!(dir.stop_signal().unwrap(), None);
        dir.set_stop_signal("SIGQUIT").unwrap();
        dir.set_restart_policy("on-failure:3").unwrap();
        assert_eq!(dir.stop_signal().unwrap().as_deref(), Some("SIGQUIT"));
        assert_eq!(dir.restart_policy().unwrap().as_deref(), Some("on-failure:3"));
        assert!(dir.log_path().ends_with("abc-json.log"));
    }

    #[test]
    fn test_process_record_defaults_and_remove() {
        let temp = tempdir().unwrap();
        let dir = ContainerDir::new(temp.path().join("abc"), "abc");
        dir.create().unwrap();

        assert_eq!(dir.process_record().unwrap(), ProcessRecord::default());
        let record = ProcessRecord {
            pid: 42,
            started_at: Some(Utc::now()),
            finished_at: None,
            exit_code: None,
        };
        dir.save_process_record(&record).unwrap();
        assert_eq!(dir.process_record().unwrap(), record);

        dir.remove().unwrap();
        dir.remove().unwrap();
        assert!(!dir.exists());
    }
}
