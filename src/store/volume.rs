//! Local volume management

use super::lock::with_dir_lock;
use super::{read_json, write_json};
use crate::error::{CtlError, ObjectKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Label marking volumes created implicitly for `-v /path` or image VOLUMEs
pub const ANONYMOUS_LABEL: &str = "runectl/anonymous";

/// A named local volume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Volume driver (always "local")
    pub driver: String,
    /// Directory bind-mounted into containers
    pub mountpoint: PathBuf,
    /// Volume labels
    pub labels: BTreeMap<String, String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl Volume {
    pub fn is_anonymous(&self) -> bool {
        self.labels.get(ANONYMOUS_LABEL).map(|v| v == "true") == Some(true)
    }

    /// Get size in bytes
    pub fn size(&self) -> u64 {
        if !self.mountpoint.exists() {
            return 0;
        }

        walkdir::WalkDir::new(&self.mountpoint)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

/// On-disk metadata next to `_data`
#[derive(Debug, Serialize, Deserialize)]
struct VolumeMeta {
    labels: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
}

/// Volumes of one namespace, stored under `<root>/volumes/<namespace>`
#[derive(Debug, Clone)]
pub struct VolumeStore {
    base_path: PathBuf,
}

impl VolumeStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Create a volume, or return the existing one with the same name
    pub fn create(&self, name: Option<&str>, labels: BTreeMap<String, String>) -> Result<Volume> {
        let volume_name = match name {
            Some(name) => {
                validate_volume_name(name)?;
                name.to_string()
            }
            None => anonymous_name(),
        };

        with_dir_lock(&self.base_path, || {
            let dir = self.base_path.join(&volume_name);
            if let Some(meta) = read_json::<VolumeMeta>(&dir.join("volume.json"))? {
                return Ok(self.volume_from(&volume_name, meta));
            }

            std::fs::create_dir_all(dir.join("_data"))?;
            let meta = VolumeMeta {
                labels,
                created_at: Utc::now(),
            };
            write_json(&dir.join("volume.json"), &meta)?;
            tracing::debug!("Created volume {}", volume_name);
            Ok(self.volume_from(&volume_name, meta))
        })
    }

    /// Create an unnamed volume for an anonymous mount
    pub fn create_anonymous(&self) -> Result<Volume> {
        let mut labels = BTreeMap::new();
        labels.insert(ANONYMOUS_LABEL.to_string(), "true".to_string());
        self.create(None, labels)
    }

    /// Get a volume by name
    pub fn get(&self, name: &str) -> Result<Volume> {
        if validate_volume_name(name).is_err() {
            return Err(CtlError::not_found(ObjectKind::Volume, name));
        }
        read_json::<VolumeMeta>(&self.base_path.join(name).join("volume.json"))?
            .map(|meta| self.volume_from(name, meta))
            .ok_or_else(|| CtlError::not_found(ObjectKind::Volume, name))
    }

    /// List all volumes, sorted by name
    pub fn list(&self) -> Result<Vec<Volume>> {
        let entries = match std::fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut volumes = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(meta) = read_json::<VolumeMeta>(&entry.path().join("volume.json"))? {
                volumes.push(self.volume_from(&name, meta));
            }
        }
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    /// Remove a volume and its data. In-use checks belong to the caller.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.get(name)?;
        with_dir_lock(&self.base_path, || {
            let dir = self.base_path.join(name);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        })
    }

    fn volume_from(&self, name: &str, meta: VolumeMeta) -> Volume {
        Volume {
            name: name.to_string(),
            driver: "local".to_string(),
            mountpoint: self.base_path.join(name).join("_data"),
            labels: meta.labels,
            created_at: meta.created_at,
        }
    }
}

fn anonymous_name() -> String {
    use rand::Rng;
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Volume names follow the container name grammar
pub fn validate_volume_name(name: &str) -> Result<()> {
    if crate::container::is_valid_name(name) {
        Ok(())
    } else {
        Err(CtlError::usage(format!(
            "invalid volume name {:?}: only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed",
            name
        )))
    }
}
