//! Image verbs: `pull`, `push`, `images`, `commit`, `build`

use super::ContainerManager;
use crate::error::{short_id, Result};
use crate::reference::image::ImageRef;
use crate::runtime::build::{BuildClient, BuildOptions};
use crate::runtime::{CommitRequest, ImageRecord, Platform};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One row of `images`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub repository: String,
    pub tag: String,
    pub digest: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

impl ImageSummary {
    fn new(image: &ImageRecord) -> Self {
        let (repository, tag) = match ImageRef::parse(&image.name) {
            Ok(reference) => {
                let name = reference.name();
                let repository = name
                    .strip_prefix("docker.io/library/")
                    .or_else(|| name.strip_prefix("docker.io/"))
                    .unwrap_or(&name)
                    .to_string();
                (repository, reference.tag().unwrap_or("<none>").to_string())
            }
            Err(_) => (image.name.clone(), "<none>".to_string()),
        };
        let hex = image
            .target
            .digest
            .split_once(':')
            .map(|(_, hex)| hex)
            .unwrap_or(&image.target.digest);
        Self {
            repository,
            tag,
            digest: image.target.digest.clone(),
            id: short_id(hex).to_string(),
            created_at: image.created_at,
            size: image.target.size,
        }
    }
}

pub fn render_images(rows: &[ImageSummary]) -> String {
    let mut out = format!(
        "{:<40}{:<16}{:<16}{}\n",
        "REPOSITORY", "TAG", "IMAGE ID", "CREATED"
    );
    let now = Utc::now();
    for row in rows {
        out.push_str(&format!(
            "{:<40}{:<16}{:<16}{} ago\n",
            row.repository,
            row.tag,
            row.id,
            super::config::human_duration(now - row.created_at)
        ));
    }
    out
}

fn platform(value: Option<&str>) -> Result<Platform> {
    value.map(Platform::parse).unwrap_or_else(|| Ok(Platform::host()))
}

impl ContainerManager {
    /// `pull`
    pub async fn pull(&self, query: &str, platform_flag: Option<&str>) -> Result<ImageRecord> {
        let reference = ImageRef::parse(query)?;
        self.images
            .pull(&reference, &platform(platform_flag)?, &self.cancel_token())
            .await
    }

    /// `push`
    pub async fn push(&self, query: &str, platform_flag: Option<&str>) -> Result<()> {
        let platform = platform_flag.map(Platform::parse).transpose()?;
        self.images.push(query, platform, &self.cancel_token()).await
    }

    /// `images`, sorted by reference
    pub async fn image_list(&self) -> Result<Vec<ImageSummary>> {
        let mut images = self.runtime.list_images(self.ns()).await?;
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images.iter().map(ImageSummary::new).collect())
    }

    /// `commit CONTAINER REFERENCE`
    pub async fn commit(
        &self,
        query: &str,
        reference: &str,
        message: Option<String>,
        author: Option<String>,
        pause: bool,
    ) -> Result<ImageRecord> {
        let record = self.resolve(query).await?;
        let reference = ImageRef::parse(reference)?;
        self.runtime
            .commit_container(
                self.ns(),
                CommitRequest {
                    container_id: record.id,
                    reference: reference.canonical(),
                    message,
                    author,
                    pause,
                },
            )
            .await
    }

    /// `build` through the build daemon
    pub async fn build(&self, opts: &BuildOptions) -> Result<()> {
        BuildClient::new(self.cfg.buildkit_host.clone())
            .build(opts, &self.cancel_token())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{manager, options, ALPINE};
    use super::*;
    use crate::runtime::memory::ImageSeed;

    #[tokio::test]
    async fn test_image_list() {
        let (manager, _runtime, _temp) = manager();
        let rows = manager.image_list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].repository, "alpine");
        assert_eq!(rows[0].tag, "latest");
        assert_eq!(rows[0].id.len(), 12);
        assert!(render_images(&rows).contains("alpine"));
    }

    #[tokio::test]
    async fn test_pull_normalizes_reference() {
        let (manager, runtime, _temp) = manager();
        runtime.add_registry_image("docker.io/library/busybox:latest", ImageSeed::default());
        let image = manager.pull("busybox", None).await.unwrap();
        assert_eq!(image.name, "docker.io/library/busybox:latest");
        assert!(manager.pull("missing-image", None).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_and_push() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["true"]);
        opts.name = Some("base".into());
        manager.create(&opts).await.unwrap();
        let image = manager
            .commit("base", "localhost:5000/snap:v1", None, None, true)
            .await
            .unwrap();
        assert_eq!(image.name, "localhost:5000/snap:v1");
        manager.push("localhost:5000/snap:v1", None).await.unwrap();
        assert!(manager.push(ALPINE, None).await.is_ok());
    }
}
