//! Image management
//!
//! Pull policy, registry pulls and pushes, and the image configuration that
//! feeds spec assembly. Image blobs never leave the runtime's content store;
//! this module only reads the manifest chain back out of it.

pub mod manifest;

use crate::error::{CtlError, ObjectKind, Result};
use crate::reference::image::ImageRef;
use crate::reference::Resolver;
use crate::registry::RegistryResolver;
use crate::runtime::{ImageRecord, Platform, PullRequest, PushRequest, Runtime};
use crate::store::DataStore;
use manifest::{ConfigFile, ImageIndex, ImageManifest};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// `--pull` policy for run and create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    Always,
    #[default]
    Missing,
    Never,
}

impl FromStr for PullPolicy {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(PullPolicy::Always),
            "missing" => Ok(PullPolicy::Missing),
            "never" => Ok(PullPolicy::Never),
            other => Err(CtlError::usage(format!(
                "invalid pull policy {:?} (expected always, missing or never)",
                other
            ))),
        }
    }
}

/// Image configuration used by the spec assembler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageConfig {
    /// Config blob digest, shown as the image ID
    pub id: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub exposed_ports: Vec<String>,
    pub volumes: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub stop_signal: Option<String>,
    pub os: String,
    pub architecture: String,
}

/// Pulls, pushes and reads images through the runtime
#[derive(Clone)]
pub struct ImageService {
    runtime: Arc<dyn Runtime>,
    store: DataStore,
    registry: RegistryResolver,
    snapshotter: String,
}

impl ImageService {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        store: DataStore,
        registry: RegistryResolver,
        snapshotter: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            store,
            registry,
            snapshotter: snapshotter.into(),
        }
    }

    fn namespace(&self) -> &str {
        self.store.namespace()
    }

    /// Make an image available according to `policy`
    ///
    /// The reference is normalized before the policy is applied, so
    /// `--pull=never alpine` looks for `docker.io/library/alpine:latest`.
    pub async fn ensure(
        &self,
        query: &str,
        policy: PullPolicy,
        platform: &Platform,
        cancel: &CancellationToken,
    ) -> Result<ImageRecord> {
        if policy != PullPolicy::Always {
            let resolver = Resolver::new(self.runtime.as_ref(), &self.store);
            match resolver.image(query).await {
                Ok(image) => return Ok(image),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        let reference = ImageRef::parse(query)?;
        if policy == PullPolicy::Never {
            return Err(CtlError::not_found(ObjectKind::Image, reference.canonical()));
        }
        self.pull(&reference, platform, cancel).await
    }

    /// Pull `reference` and unpack it into the configured snapshotter
    pub async fn pull(
        &self,
        reference: &ImageRef,
        platform: &Platform,
        cancel: &CancellationToken,
    ) -> Result<ImageRecord> {
        let canonical = reference.canonical();
        let endpoint = self.registry.endpoint(reference.domain())?;
        let credentials = self.registry.lookup_credentials(reference.domain())?;
        let progress = std::io::stdout().is_terminal();
        if progress {
            eprintln!("{}: resolving from {}", canonical, endpoint.url);
        }
        debug!("pulling {} for {} via {}", canonical, platform, endpoint.url);

        let request = PullRequest {
            reference: canonical.clone(),
            source: reference.source(),
            platform: platform.clone(),
            endpoint,
            credentials,
            unpack: Some(self.snapshotter.clone()),
        };
        let image = tokio::select! {
            image = self.runtime.pull_image(self.namespace(), request) => image?,
            _ = cancel.cancelled() => return Err(CtlError::Canceled { user: true }),
        };
        if progress {
            eprintln!("{}: pulled {}", canonical, image.target.digest);
        }
        info!("pulled {} ({})", canonical, image.target.digest);
        Ok(image)
    }

    /// Push a local image to its registry
    pub async fn push(
        &self,
        query: &str,
        platform: Option<Platform>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let resolver = Resolver::new(self.runtime.as_ref(), &self.store);
        let image = resolver.image(query).await?;
        let reference = ImageRef::parse(&image.name)?;
        let request = PushRequest {
            reference: image.name.clone(),
            platform,
            endpoint: self.registry.endpoint(reference.domain())?,
            credentials: self.registry.lookup_credentials(reference.domain())?,
        };
        tokio::select! {
            result = self.runtime.push_image(self.namespace(), request) => result,
            _ = cancel.cancelled() => Err(CtlError::Canceled { user: true }),
        }
    }

    /// Read the image configuration for `platform` out of the content store
    pub async fn config(&self, image: &ImageRecord, platform: &Platform) -> Result<ImageConfig> {
        let ns = self.namespace();
        let target = &image.target;

        let data = self.runtime.read_content(ns, &target.digest).await?;
        let manifest_data = if manifest::is_index(&target.media_type) || looks_like_index(&data) {
            let index: ImageIndex = serde_json::from_slice(&data)?;
            let chosen = select_platform(&index, platform).ok_or_else(|| {
                CtlError::not_found(
                    ObjectKind::Image,
                    format!("{} for platform {}", image.name, platform),
                )
            })?;
            self.runtime.read_content(ns, &chosen.digest).await?
        } else {
            data
        };

        let manifest: ImageManifest = serde_json::from_slice(&manifest_data)?;
        let config_data = self.runtime.read_content(ns, &manifest.config.digest).await?;
        let config: ConfigFile = serde_json::from_slice(&config_data)?;
        Ok(image_config(&manifest.config.digest, config))
    }
}

fn looks_like_index(data: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(data)
        .map(|v| v.get("manifests").is_some())
        .unwrap_or(false)
}

fn select_platform<'a>(
    index: &'a ImageIndex,
    platform: &Platform,
) -> Option<&'a manifest::Descriptor> {
    let matches = |d: &&manifest::Descriptor| match &d.platform {
        Some(p) => {
            p.os == platform.os
                && p.architecture == platform.architecture
                && (platform.variant.is_none() || p.variant == platform.variant)
        }
        None => false,
    };
    index.manifests.iter().find(matches).or_else(|| {
        // Single-entry indexes without platform data are taken as-is.
        match index.manifests.as_slice() {
            [only] if only.platform.is_none() => Some(only),
            _ => None,
        }
    })
}

fn image_config(id: &str, file: ConfigFile) -> ImageConfig {
    let config = file.config.unwrap_or_default();
    ImageConfig {
        id: id.to_string(),
        entrypoint: config.entrypoint.unwrap_or_default(),
        cmd: config.cmd.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        working_dir: config.working_dir.filter(|w| !w.is_empty()),
        user: config.user.filter(|u| !u.is_empty()),
        exposed_ports: config
            .exposed_ports
            .map(|p| p.into_keys().collect())
            .unwrap_or_default(),
        volumes: config
            .volumes
            .map(|v| v.into_keys().collect())
            .unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        stop_signal: config.stop_signal.filter(|s| !s.is_empty()),
        os: file.os,
        architecture: file.architecture,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory::ImageSeed;
    use crate::runtime::MemoryRuntime;
    use tempfile::tempdir;

    fn service(runtime: Arc<MemoryRuntime>, root: &std::path::Path) -> ImageService {
        let store = DataStore::with_host(root, "test", "default");
        let registry = RegistryResolver::new(Vec::new(), Vec::new(), store.auth_file());
        ImageService::new(runtime, store, registry, "overlayfs")
    }

    fn seed() -> ImageSeed {
        ImageSeed {
            config: serde_json::json!({
                "Entrypoint": ["/docker-entrypoint.sh"],
                "Cmd": ["nginx", "-g", "daemon off;"],
                "Env": ["PATH=/usr/bin:/bin"],
                "ExposedPorts": { "80/tcp": {} },
                "Volumes": { "/var/cache": {} },
                "StopSignal": "SIGQUIT",
            }),
            files: Vec::new(),
        }
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!("never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert!("sometimes".parse::<PullPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_never_policy_normalizes_first() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(MemoryRuntime::with_root(temp.path().join("rt")));
        let images = service(runtime.clone(), temp.path());
        let cancel = CancellationToken::new();

        let err = images
            .ensure("alpine", PullPolicy::Never, &Platform::host(), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("docker.io/library/alpine:latest"));

        runtime
            .load_image("default", "docker.io/library/alpine:latest", ImageSeed::default())
            .unwrap();
        let image = images
            .ensure("alpine", PullPolicy::Never, &Platform::host(), &cancel)
            .await
            .unwrap();
        assert_eq!(image.name, "docker.io/library/alpine:latest");
    }

    #[tokio::test]
    async fn test_missing_policy_pulls_and_reads_config() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(MemoryRuntime::with_root(temp.path().join("rt")));
        runtime.add_registry_image("docker.io/library/nginx:latest", seed());
        let images = service(runtime.clone(), temp.path());
        let cancel = CancellationToken::new();

        let image = images
            .ensure("nginx", PullPolicy::Missing, &Platform::host(), &cancel)
            .await
            .unwrap();
        let config = images.config(&image, &Platform::host()).await.unwrap();
        assert_eq!(config.entrypoint, vec!["/docker-entrypoint.sh"]);
        assert_eq!(config.cmd[0], "nginx");
        assert_eq!(config.exposed_ports, vec!["80/tcp"]);
        assert_eq!(config.volumes, vec!["/var/cache"]);
        assert_eq!(config.stop_signal.as_deref(), Some("SIGQUIT"));
        assert!(config.id.starts_with("sha256:"));
    }

    #[test]
    fn test_select_platform() {
        let index: ImageIndex = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "manifests": [
                { "mediaType": manifest::OCI_MANIFEST, "digest": "sha256:arm", "size": 1,
                  "platform": { "os": "linux", "architecture": "arm64", "variant": "v8" } },
                { "mediaType": manifest::OCI_MANIFEST, "digest": "sha256:amd", "size": 1,
                  "platform": { "os": "linux", "architecture": "amd64" } },
            ]
        }))
        .unwrap();
        let amd64 = Platform::parse("linux/amd64").unwrap();
        assert_eq!(select_platform(&index, &amd64).unwrap().digest, "sha256:amd");
        let arm = Platform::parse("linux/arm64/v8").unwrap();
        assert_eq!(select_platform(&index, &arm).unwrap().digest, "sha256:arm");
        let s390 = Platform::parse("linux/s390x").unwrap();
        assert!(select_platform(&index, &s390).is_none());
    }
}
