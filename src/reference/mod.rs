//! Reference resolution
//!
//! Turns what the user typed into exactly one object, or fails with
//! `NotFound` / `AmbiguousReference`. Containers match by exact ID, then
//! unique ID prefix, then exact name; a prefix shared by several IDs falls
//! through to the name before it is reported as ambiguous. Images match by
//! canonical name, then `name@digest`, then digest prefix.

pub mod image;

use crate::container::labels;
use crate::error::{CtlError, ObjectKind, Result};
use crate::network::NetworkConfig;
use crate::runtime::{ContainerRecord, ImageRecord, Runtime};
use crate::store::{DataStore, Volume};
use image::{is_digest_query, ImageRef};
use tracing::{debug, warn};

/// Resolves user queries against the runtime and the name store
pub struct Resolver<'a> {
    runtime: &'a dyn Runtime,
    store: &'a DataStore,
}

impl<'a> Resolver<'a> {
    pub fn new(runtime: &'a dyn Runtime, store: &'a DataStore) -> Self {
        Self { runtime, store }
    }

    fn ns(&self) -> &str {
        self.store.namespace()
    }

    /// Find one container by ID, unique ID prefix or name
    pub async fn container(&self, query: &str) -> Result<ContainerRecord> {
        if query.is_empty() {
            return Err(CtlError::not_found(ObjectKind::Container, query));
        }

        match self.runtime.load_container(self.ns(), query).await {
            Ok(record) => return Ok(record),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let all = self.runtime.list_containers(self.ns()).await?;
        let mut matches: Vec<&ContainerRecord> =
            all.iter().filter(|c| c.id.starts_with(query)).collect();
        if matches.len() == 1 {
            return Ok(matches.remove(0).clone());
        }

        let names = self.store.names();
        if let Some(id) = names.lookup(ObjectKind::Container, query)? {
            match self.runtime.load_container(self.ns(), &id).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_not_found() => {
                    // The client that held this name died before cleaning up.
                    debug!("releasing orphaned name {} -> {}", query, id);
                    names.release(ObjectKind::Container, query, &id)?;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(record) = all.iter().find(|c| c.label(labels::NAME) == Some(query)) {
            // Runtime object without a binding: restore it.
            if let Err(e) = names.reserve(ObjectKind::Container, query, &record.id) {
                warn!("cannot restore name binding {}: {}", query, e);
            }
            return Ok(record.clone());
        }

        match matches.len() {
            0 => Err(CtlError::not_found(ObjectKind::Container, query)),
            _ => Err(CtlError::AmbiguousReference {
                kind: ObjectKind::Container,
                query: query.to_string(),
                candidates: matches.iter().map(|c| c.id.clone()).collect(),
            }),
        }
    }

    /// Find one image by reference, digest or ID prefix
    ///
    /// Several names pointing at the same digest are one image, not an
    /// ambiguity.
    pub async fn image(&self, query: &str) -> Result<ImageRecord> {
        if query.is_empty() {
            return Err(CtlError::not_found(ObjectKind::Image, query));
        }

        let parsed = ImageRef::parse(query).ok();
        if let Some(reference) = &parsed {
            match self.runtime.get_image(self.ns(), &reference.canonical()).await {
                Ok(image) => return Ok(image),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let mut all = self.runtime.list_images(self.ns()).await?;
        all.sort_by(|a, b| a.name.cmp(&b.name));

        if let Some(reference) = &parsed {
            if let Some(digest) = reference.digest() {
                let name = reference.name();
                if let Some(image) = all.iter().find(|i| {
                    i.target.digest == digest
                        && ImageRef::parse(&i.name)
                            .map(|r| r.name() == name)
                            .unwrap_or(false)
                }) {
                    return Ok(image.clone());
                }
            }
        }

        if !is_digest_query(query) {
            return Err(CtlError::not_found(
                ObjectKind::Image,
                parsed.map(|r| r.canonical()).unwrap_or_else(|| query.to_string()),
            ));
        }
        let prefix = query.strip_prefix("sha256:").unwrap_or(query);
        let matches: Vec<&ImageRecord> = all
            .iter()
            .filter(|i| {
                i.target
                    .digest
                    .strip_prefix("sha256:")
                    .unwrap_or(&i.target.digest)
                    .starts_with(prefix)
            })
            .collect();
        let mut digests: Vec<&str> = matches.iter().map(|i| i.target.digest.as_str()).collect();
        digests.sort_unstable();
        digests.dedup();
        match (matches.first(), digests.len()) {
            (None, _) => Err(CtlError::not_found(ObjectKind::Image, query)),
            (Some(image), 1) => Ok((*image).clone()),
            _ => Err(CtlError::AmbiguousReference {
                kind: ObjectKind::Image,
                query: query.to_string(),
                candidates: digests.iter().map(|d| d.to_string()).collect(),
            }),
        }
    }

    /// Find a named local volume
    pub fn volume(&self, query: &str) -> Result<Volume> {
        if query.is_empty() {
            return Err(CtlError::not_found(ObjectKind::Volume, query));
        }
        self.store.volumes().get(query)
    }
}

/// Find one network by ID, name or unique ID prefix
pub fn resolve_network(networks: &[NetworkConfig], query: &str) -> Result<NetworkConfig> {
    if query.is_empty() {
        return Err(CtlError::not_found(ObjectKind::Network, query));
    }
    if let Some(network) = networks
        .iter()
        .find(|n| n.id == query)
        .or_else(|| networks.iter().find(|n| n.name == query))
    {
        return Ok(network.clone());
    }
    let matches: Vec<&NetworkConfig> = networks.iter().filter(|n| n.id.starts_with(query)).collect();
    match matches.as_slice() {
        [] => Err(CtlError::not_found(ObjectKind::Network, query)),
        [one] => Ok((*one).clone()),
        many => Err(CtlError::AmbiguousReference {
            kind: ObjectKind::Network,
            query: query.to_string(),
            candidates: many.iter().map(|n| n.name.clone()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory::ImageSeed;
    use crate::runtime::MemoryRuntime;
    use chrono::Utc;
    use oci_spec::runtime::Spec;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn record(id: &str, name: &str) -> ContainerRecord {
        let mut labels = BTreeMap::new();
        labels.insert(labels::NAME.to_string(), name.to_string());
        ContainerRecord {
            id: id.to_string(),
            image: "docker.io/library/alpine:latest".to_string(),
            labels,
            spec: Spec::default(),
            snapshotter: "overlayfs".to_string(),
            snapshot_key: id.to_string(),
            runtime: crate::runtime::DEFAULT_OCI_RUNTIME.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_container_matching_order() {
        let temp = tempdir().unwrap();
        let store = DataStore::with_host(temp.path(), "test", "default");
        let runtime = MemoryRuntime::with_root(temp.path().join("rt"));
        for (id, name) in [("abc123", "web"), ("abd456", "abc"), ("fff000", "ab")] {
            runtime.create_container("default", record(id, name)).await.unwrap();
            store.names().reserve(ObjectKind::Container, name, id).unwrap();
        }
        let resolver = Resolver::new(&runtime, &store);

        assert_eq!(resolver.container("abc123").await.unwrap().id, "abc123");
        // A unique ID prefix beats a container named the same.
        assert_eq!(resolver.container("abc").await.unwrap().id, "abc123");
        assert_eq!(resolver.container("web").await.unwrap().id, "abc123");
        assert_eq!(resolver.container("ff").await.unwrap().id, "fff000");
        // "ab" prefixes two IDs; the name settles it.
        assert_eq!(resolver.container("ab").await.unwrap().id, "fff000");

        let err = resolver.container("a").await.unwrap_err();
        assert!(matches!(err, CtlError::AmbiguousReference { ref candidates, .. } if candidates.len() == 2));
        assert!(resolver.container("").await.unwrap_err().is_not_found());
        assert!(resolver.container("zzz").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_orphaned_binding_released_on_reference() {
        let temp = tempdir().unwrap();
        let store = DataStore::with_host(temp.path(), "test", "default");
        let runtime = MemoryRuntime::with_root(temp.path().join("rt"));
        store
            .names()
            .reserve(ObjectKind::Container, "ghost", "deadbeef")
            .unwrap();

        let resolver = Resolver::new(&runtime, &store);
        assert!(resolver.container("ghost").await.unwrap_err().is_not_found());
        store
            .names()
            .reserve(ObjectKind::Container, "ghost", "cafebabe")
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_binding_restored_from_label() {
        let temp = tempdir().unwrap();
        let store = DataStore::with_host(temp.path(), "test", "default");
        let runtime = MemoryRuntime::with_root(temp.path().join("rt"));
        runtime.create_container("default", record("0a0a0a", "api")).await.unwrap();

        let resolver = Resolver::new(&runtime, &store);
        assert_eq!(resolver.container("api").await.unwrap().id, "0a0a0a");
        assert_eq!(
            store.names().lookup(ObjectKind::Container, "api").unwrap(),
            Some("0a0a0a".to_string())
        );
    }

    #[tokio::test]
    async fn test_image_resolution() {
        let temp = tempdir().unwrap();
        let store = DataStore::with_host(temp.path(), "test", "default");
        let runtime = MemoryRuntime::with_root(temp.path().join("rt"));
        let alpine = runtime
            .load_image("default", "docker.io/library/alpine:latest", ImageSeed::default())
            .unwrap();
        // Same content under a second name.
        runtime
            .load_image("default", "docker.io/library/alpine:3", ImageSeed::default())
            .unwrap();
        let resolver = Resolver::new(&runtime, &store);

        assert_eq!(resolver.image("alpine").await.unwrap().name, alpine.name);
        let hex = alpine.target.digest.trim_start_matches("sha256:");
        assert_eq!(
            resolver.image(&hex[..12]).await.unwrap().target.digest,
            alpine.target.digest
        );
        let by_digest = format!("alpine@{}", alpine.target.digest);
        assert_eq!(
            resolver.image(&by_digest).await.unwrap().target.digest,
            alpine.target.digest
        );
        let err = resolver.image("busybox").await.unwrap_err();
        assert!(err.to_string().contains("docker.io/library/busybox:latest"));
    }

    #[test]
    fn test_network_resolution() {
        let mut a = NetworkConfig::new("front");
        a.id = "aa11".into();
        let mut b = NetworkConfig::new("back");
        b.id = "aa22".into();
        let networks = vec![a, b];
        assert_eq!(resolve_network(&networks, "back").unwrap().id, "aa22");
        assert_eq!(resolve_network(&networks, "aa1").unwrap().name, "front");
        assert!(matches!(
            resolve_network(&networks, "aa"),
            Err(CtlError::AmbiguousReference { .. })
        ));
        assert!(resolve_network(&networks, "").is_err());
    }
}
