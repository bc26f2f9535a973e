//! `/etc/hosts` files shared across containers on the same network

use super::lock::with_dir_lock;
use super::{read_json, write_json};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;

/// What a container contributes to the hosts files of its neighbours
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostsMeta {
    pub id: String,
    pub name: String,
    pub hostname: String,
    /// Networks the container is attached to
    pub networks: Vec<String>,
    /// (network, address) pairs assigned by IPAM
    pub addresses: Vec<(String, String)>,
    /// (hostname, address) pairs from `--add-host`
    pub extra_hosts: Vec<(String, String)>,
}

/// `<root>/<host>/<namespace>/etchosts`
#[derive(Debug, Clone)]
pub struct EtcHosts {
    dir: PathBuf,
}

impl EtcHosts {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Hosts file bind-mounted at `/etc/hosts` in the container
    pub fn hosts_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join("hosts")
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join("meta.json")
    }

    /// Record the container and write its initial hosts file
    pub fn prepare(&self, meta: &HostsMeta) -> Result<PathBuf> {
        with_dir_lock(&self.dir, || {
            write_json(&self.meta_path(&meta.id), meta)?;
            self.render_one(meta)?;
            Ok(self.hosts_path(&meta.id))
        })
    }

    /// Replace the container's assigned addresses and refresh its neighbours
    pub fn set_addresses(&self, id: &str, addresses: Vec<(String, String)>) -> Result<()> {
        with_dir_lock(&self.dir, || {
            let mut meta = match read_json::<HostsMeta>(&self.meta_path(id))? {
                Some(meta) => meta,
                None => return Ok(()),
            };
            meta.addresses = addresses;
            write_json(&self.meta_path(id), &meta)?;
            self.refresh(&meta.networks)
        })
    }

    /// Forget the container and drop it from its neighbours' hosts files
    pub fn remove(&self, id: &str) -> Result<()> {
        with_dir_lock(&self.dir, || {
            let networks = read_json::<HostsMeta>(&self.meta_path(id))?
                .map(|m| m.networks)
                .unwrap_or_default();
            match std::fs::remove_dir_all(self.dir.join(id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.refresh(&networks)
        })
    }

    fn all(&self) -> Result<Vec<HostsMeta>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut metas = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(meta) = read_json::<HostsMeta>(&entry.path().join("meta.json"))? {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(metas)
    }

    // Caller holds the directory lock.
    fn refresh(&self, networks: &[String]) -> Result<()> {
        let networks: BTreeSet<&String> = networks.iter().collect();
        let all = self.all()?;
        for meta in &all {
            if meta.networks.iter().any(|n| networks.contains(n)) {
                self.write_hosts(meta, &all)?;
            }
        }
        Ok(())
    }

    fn render_one(&self, meta: &HostsMeta) -> Result<()> {
        let all = self.all()?;
        self.write_hosts(meta, &all)
    }

    fn write_hosts(&self, meta: &HostsMeta, all: &[HostsMeta]) -> Result<()> {
        let content = render(meta, all);
        // Truncate in place: the file is bind-mounted, a rename would detach it.
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.hosts_path(&meta.id))?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }
}

fn render(meta: &HostsMeta, all: &[HostsMeta]) -> String {
    let mut out = String::from("# generated by runectl\n");
    out.push_str("127.0.0.1\tlocalhost localhost.localdomain\n");
    out.push_str("::1\tlocalhost localhost.localdomain ip6-localhost ip6-loopback\n");

    let names = |m: &HostsMeta| {
        if m.name.is_empty() || m.name == m.hostname {
            m.hostname.clone()
        } else {
            format!("{} {}", m.hostname, m.name)
        }
    };

    for (_, address) in &meta.addresses {
        out.push_str(&format!("{}\t{}\n", address, names(meta)));
    }
    for (host, address) in &meta.extra_hosts {
        out.push_str(&format!("{}\t{}\n", address, host));
    }
    for other in all {
        if other.id == meta.id {
            continue;
        }
        for (network, address) in &other.addresses {
            if meta.networks.contains(network) {
                out.push_str(&format!("{}\t{}\n", address, names(other)));
            }
        }
    }
    out
}
