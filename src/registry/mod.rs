//! Registry transport selection
//!
//! Decides how the runtime reaches a registry: HTTPS by default, plain HTTP
//! for localhost, loopback literals and `--insecure-registry` hosts, with
//! per-host overrides read from `<hosts-dir>/<host>/hosts.toml`.

pub mod auth;

pub use auth::CredentialStore;

use crate::error::Result;
use crate::runtime::{Credentials, RegistryEndpoint};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Registry host Docker Hub pulls are sent to
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

#[derive(Debug, Default, Deserialize)]
struct HostsFile {
    server: Option<String>,
    #[serde(default)]
    host: std::collections::BTreeMap<String, HostEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct HostEntry {
    skip_verify: Option<bool>,
    #[serde(default)]
    capabilities: Vec<String>,
}

/// Registry endpoint and credential resolution
#[derive(Debug, Clone)]
pub struct RegistryResolver {
    hosts_dirs: Vec<PathBuf>,
    insecure: Vec<String>,
    credentials: CredentialStore,
}

impl RegistryResolver {
    pub fn new(hosts_dirs: Vec<PathBuf>, insecure: Vec<String>, auth_file: PathBuf) -> Self {
        Self {
            hosts_dirs,
            insecure,
            credentials: CredentialStore::new(auth_file),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Whether plain HTTP is allowed for `host`
    pub fn is_insecure(&self, host: &str) -> bool {
        is_local(host) || self.insecure.iter().any(|h| h == host)
    }

    /// Endpoint used to reach the registry serving `domain`
    pub fn endpoint(&self, domain: &str) -> Result<RegistryEndpoint> {
        let upstream = if domain == "docker.io" {
            DOCKER_HUB_REGISTRY
        } else {
            domain
        };
        let plain_http = self.is_insecure(domain);
        let scheme = if plain_http { "http" } else { "https" };
        let mut endpoint = RegistryEndpoint {
            host: domain.to_string(),
            url: format!("{}://{}", scheme, upstream),
            plain_http,
            skip_verify: false,
        };

        if let Some(path) = self.hosts_toml(domain) {
            let content = std::fs::read_to_string(&path)?;
            let file: HostsFile = toml::from_str(&content)?;
            debug!("registry {} configured by {}", domain, path.display());
            // A mirror with pull capability takes precedence over the server.
            let mirror = file
                .host
                .iter()
                .find(|(_, h)| h.capabilities.is_empty() || h.capabilities.iter().any(|c| c == "pull"));
            if let Some((url, entry)) = mirror {
                endpoint.url = url.trim_end_matches('/').to_string();
                endpoint.skip_verify = entry.skip_verify.unwrap_or(false);
            } else if let Some(server) = file.server {
                endpoint.url = server.trim_end_matches('/').to_string();
            }
            endpoint.plain_http = endpoint.plain_http || endpoint.url.starts_with("http://");
        }
        Ok(endpoint)
    }

    /// Stored credentials for `domain`
    pub fn lookup_credentials(&self, domain: &str) -> Result<Option<Credentials>> {
        self.credentials.get(domain)
    }

    fn hosts_toml(&self, domain: &str) -> Option<PathBuf> {
        let dir_name = domain.replace(':', "_");
        self.hosts_dirs.iter().find_map(|dir| {
            [domain, dir_name.as_str()]
                .iter()
                .map(|name| Path::new(dir).join(name).join("hosts.toml"))
                .find(|p| p.is_file())
        })
    }
}

/// `localhost[:port]` and loopback literals
pub fn is_local(host: &str) -> bool {
    let bare = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
            _ => host,
        }
    };
    if bare == "localhost" {
        return true;
    }
    bare.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_is_local() {
        assert!(is_local("localhost"));
        assert!(is_local("localhost:5000"));
        assert!(is_local("127.0.0.1:5000"));
        assert!(is_local("[::1]:5000"));
        assert!(!is_local("ghcr.io"));
        assert!(!is_local("10.0.0.1:5000"));
    }

    #[test]
    fn test_endpoint_selection() {
        let temp = tempdir().unwrap();
        let resolver = RegistryResolver::new(
            vec![temp.path().to_path_buf()],
            vec!["registry.lan:5000".to_string()],
            temp.path().join("auth.json"),
        );

        let hub = resolver.endpoint("docker.io").unwrap();
        assert_eq!(hub.url, "https://registry-1.docker.io");
        assert!(!hub.plain_http);

        assert!(resolver.endpoint("localhost:5000").unwrap().plain_http);
        let lan = resolver.endpoint("registry.lan:5000").unwrap();
        assert_eq!(lan.url, "http://registry.lan:5000");
    }

    #[test]
    fn test_hosts_toml_override() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("mirror.example.com");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("hosts.toml"),
            r#"
server = "https://mirror.example.com"

[host."https://cache.example.com:8443"]
capabilities = ["pull", "resolve"]
skip_verify = true
"#,
        )
        .unwrap();
        let resolver = RegistryResolver::new(
            vec![temp.path().to_path_buf()],
            Vec::new(),
            temp.path().join("auth.json"),
        );
        let endpoint = resolver.endpoint("mirror.example.com").unwrap();
        assert_eq!(endpoint.url, "https://cache.example.com:8443");
        assert!(endpoint.skip_verify);
    }
}
