//! Client-side persistent state
//!
//! Everything the client keeps on disk lives under the data root:
//!
//! ```text
//! <root>/<hostname>/<namespace>/containers/<id>/   per-container state
//! <root>/<hostname>/<namespace>/names/<kind>/       name bindings
//! <root>/<hostname>/<namespace>/etchosts/<id>/      /etc/hosts for the container
//! <root>/volumes/<namespace>/<name>/_data           local volumes
//! ```

pub mod container;
pub mod etchosts;
pub mod lock;
pub mod names;
pub mod volume;

pub use container::{ContainerDir, ProcessRecord};
pub use etchosts::{EtcHosts, HostsMeta};
pub use lock::DirLock;
pub use names::NameStore;
pub use volume::{Volume, VolumeStore};

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Layout of the data root for one namespace
#[derive(Debug, Clone)]
pub struct DataStore {
    root: PathBuf,
    host: String,
    namespace: String,
}

impl DataStore {
    /// Layout for the current host
    pub fn new(root: impl Into<PathBuf>, namespace: &str) -> Self {
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        Self::with_host(root, &host, namespace)
    }

    pub fn with_host(root: impl Into<PathBuf>, host: &str, namespace: &str) -> Self {
        Self {
            root: root.into(),
            host: host.to_string(),
            namespace: namespace.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn ns_root(&self) -> PathBuf {
        self.root.join(&self.host).join(&self.namespace)
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.ns_root().join("containers")
    }

    pub fn container(&self, id: &str) -> ContainerDir {
        ContainerDir::new(self.containers_dir().join(id), id)
    }

    pub fn names(&self) -> NameStore {
        NameStore::new(self.ns_root().join("names"))
    }

    pub fn hosts(&self) -> EtcHosts {
        EtcHosts::new(self.ns_root().join("etchosts"))
    }

    pub fn volumes(&self) -> VolumeStore {
        VolumeStore::new(self.root.join("volumes").join(&self.namespace))
    }

    /// Registry credentials in Docker config format
    pub fn auth_file(&self) -> PathBuf {
        self.root.join("auth.json")
    }
}

/// Write a file by renaming a sibling temp file over it
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, std::process::id()));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &data)
}

/// Read a JSON file, `None` when it does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout() {
        let store = DataStore::with_host("/var/lib/runectl", "node1", "default");
        assert_eq!(
            store.container("abc").path(),
            Path::new("/var/lib/runectl/node1/default/containers/abc")
        );
        assert_eq!(store.auth_file(), Path::new("/var/lib/runectl/auth.json"));
    }

    #[test]
    fn test_json_round_trip_and_missing() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("value.json");
        assert!(read_json::<Vec<u32>>(&path).unwrap().is_none());
        write_json(&path, &vec![1u32, 2, 3]).unwrap();
        assert_eq!(read_json::<Vec<u32>>(&path).unwrap(), Some(vec![1, 2, 3]));
    }
}
