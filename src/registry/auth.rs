//! Registry credentials
//!
//! Reads and writes `<data-root>/auth.json` in the Docker config file format:
//! `{"auths": {"<server>": {"auth": base64("user:secret")}}}`.

use crate::error::{CtlError, Result};
use crate::runtime::Credentials;
use crate::store::{read_json, write_json};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Key Docker uses for Docker Hub credentials
pub const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(
        default,
        rename = "identitytoken",
        skip_serializing_if = "Option::is_none"
    )]
    pub identity_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthFile {
    #[serde(default)]
    pub auths: BTreeMap<String, AuthEntry>,
    /// Keys we do not interpret are preserved on save
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Credential store backed by a Docker config file
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

/// Key under which credentials for `host` are stored
pub fn auth_key(host: &str) -> String {
    if host == "docker.io" || host == "index.docker.io" || host == "registry-1.docker.io" {
        DOCKER_HUB_AUTH_KEY.to_string()
    } else {
        host.to_string()
    }
}

fn strip_scheme(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key.split('/').next().unwrap_or(key)
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<AuthFile> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    /// Credentials for a registry host, if any are stored
    pub fn get(&self, host: &str) -> Result<Option<Credentials>> {
        let file = self.load()?;
        let key = auth_key(host);
        let entry = file.auths.get(&key).or_else(|| {
            file.auths
                .iter()
                .find(|(k, _)| strip_scheme(k) == strip_scheme(&key))
                .map(|(_, v)| v)
        });
        let Some(entry) = entry else {
            return Ok(None);
        };

        if let Some(token) = &entry.identity_token {
            return Ok(Some(Credentials {
                username: String::new(),
                secret: token.clone(),
            }));
        }
        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(Some(Credentials {
                username: username.clone(),
                secret: password.clone(),
            }));
        }
        match &entry.auth {
            Some(encoded) => decode_auth(encoded).map(Some),
            None => Ok(None),
        }
    }

    /// Store credentials for a host
    pub fn store(&self, host: &str, credentials: &Credentials) -> Result<()> {
        let mut file = self.load()?;
        let raw = format!("{}:{}", credentials.username, credentials.secret);
        file.auths.insert(
            auth_key(host),
            AuthEntry {
                auth: Some(STANDARD.encode(raw)),
                ..Default::default()
            },
        );
        write_json(&self.path, &file)
    }

    /// Forget a host; returns whether anything was removed
    pub fn erase(&self, host: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file.auths.remove(&auth_key(host)).is_some();
        if removed {
            write_json(&self.path, &file)?;
        }
        Ok(removed)
    }
}

fn decode_auth(encoded: &str) -> Result<Credentials> {
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CtlError::InvalidConfig(format!("invalid auth entry: {}", e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| CtlError::InvalidConfig("invalid auth entry: not UTF-8".to_string()))?;
    let (username, secret) = decoded
        .split_once(':')
        .ok_or_else(|| CtlError::InvalidConfig("invalid auth entry: missing ':'".to_string()))?;
    Ok(Credentials {
        username: username.to_string(),
        secret: secret.to_string(),
    })
}
