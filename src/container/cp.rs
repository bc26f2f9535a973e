//! `cp` between the host and a container's filesystem
//!
//! A running container is reached through `/proc/<pid>/root`; a stopped
//! one through its snapshot (bind source, or overlay upper then lower
//! layers). Every container-side path is secure-joined onto that root.

use super::ContainerManager;
use crate::error::{CtlError, Result};
use crate::spec::secure_join;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// One side of a `cp`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyTarget {
    Host(PathBuf),
    Container { query: String, path: String },
    /// `-`: a tar stream on stdin or stdout
    Stream,
}

impl CopyTarget {
    /// `container:path`, `-` or a host path
    pub fn parse(value: &str) -> Self {
        if value == "-" {
            return CopyTarget::Stream;
        }
        match value.split_once(':') {
            Some((container, path))
                if !container.is_empty()
                    && !container.contains('/')
                    && !container.starts_with('.') =>
            {
                CopyTarget::Container {
                    query: container.to_string(),
                    path: if path.is_empty() { "/".into() } else { path.to_string() },
                }
            }
            _ => CopyTarget::Host(PathBuf::from(value)),
        }
    }
}

/// Filesystem layers of a container, topmost first
struct ContainerFs {
    layers: Vec<PathBuf>,
}

impl ContainerFs {
    /// Writable root
    fn top(&self) -> Result<&Path> {
        self.layers
            .first()
            .map(PathBuf::as_path)
            .ok_or_else(|| CtlError::internal("container has no root filesystem"))
    }

    /// Where an existing path lives
    fn find(&self, path: &str) -> Result<PathBuf> {
        for layer in &self.layers {
            let candidate = secure_join(layer, Path::new(path))?;
            if fs::symlink_metadata(&candidate).is_ok() {
                return Ok(candidate);
            }
        }
        Err(CtlError::InvalidPath {
            path: path.to_string(),
            reason: "no such file or directory in the container".to_string(),
        })
    }
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name().ok_or_else(|| CtlError::InvalidPath {
        path: path.display().to_string(),
        reason: "cannot copy the filesystem root by name".to_string(),
    })
}

/// Copy a file or tree; a directory destination receives `src` by name
fn copy_path(src: &Path, dst: &Path) -> Result<u64> {
    let dst = if dst.is_dir() {
        dst.join(file_name(src)?)
    } else {
        dst.to_path_buf()
    };
    let meta = fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        return copy_entry(src, &dst, &meta);
    }
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| CtlError::internal(format!("walking {}: {}", src.display(), e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| CtlError::internal(e.to_string()))?;
        let target = dst.join(rel);
        let meta = entry
            .metadata()
            .map_err(|e| CtlError::internal(format!("{}: {}", entry.path().display(), e)))?;
        if meta.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copied += copy_entry(entry.path(), &target, &meta)?;
        }
    }
    Ok(copied)
}

fn copy_entry(src: &Path, dst: &Path, meta: &fs::Metadata) -> Result<u64> {
    if meta.file_type().is_symlink() {
        let link = fs::read_link(src)?;
        let _ = fs::remove_file(dst);
        std::os::unix::fs::symlink(link, dst)?;
        return Ok(0);
    }
    Ok(fs::copy(src, dst)?)
}

/// Unpack a tar stream below `dest`, each member secure-joined
fn unpack(stream: &mut dyn Read, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(stream);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let target = secure_join(dest, &path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

/// Write `src` as a tar stream, rooted at its own name
fn pack(src: &Path, stream: &mut dyn Write) -> Result<()> {
    let mut builder = tar::Builder::new(stream);
    builder.follow_symlinks(false);
    let name = file_name(src).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
    if fs::symlink_metadata(src)?.is_dir() {
        builder.append_dir_all(&name, src)?;
    } else {
        builder.append_path_with_name(src, &name)?;
    }
    builder.finish()?;
    Ok(())
}

impl ContainerManager {
    async fn container_fs(&self, query: &str) -> Result<ContainerFs> {
        let record = self.resolve(query).await?;
        let state = self.state(&record).await?;
        if state.is_running() {
            let root = PathBuf::from(format!("/proc/{}/root", state.pid));
            if root.exists() {
                return Ok(ContainerFs { layers: vec![root] });
            }
            debug!("{} is not visible, using the snapshot", root.display());
        }
        let mounts = self
            .runtime
            .snapshot_mounts(self.ns(), &record.snapshotter, &record.snapshot_key)
            .await?;
        let mut layers = Vec::new();
        for mount in mounts {
            match mount.typ.as_str() {
                "bind" | "rbind" => layers.push(PathBuf::from(&mount.source)),
                "overlay" => {
                    for opt in &mount.options {
                        if let Some(upper) = opt.strip_prefix("upperdir=") {
                            layers.insert(0, PathBuf::from(upper));
                        } else if let Some(lower) = opt.strip_prefix("lowerdir=") {
                            layers.extend(lower.split(':').map(PathBuf::from));
                        }
                    }
                }
                other => debug!("ignoring {} mount of the snapshot", other),
            }
        }
        Ok(ContainerFs { layers })
    }

    /// `cp SRC DEST`; exactly one side names a container
    pub async fn cp(
        &self,
        src: &str,
        dst: &str,
        stdin: &mut (dyn Read + Send),
        stdout: &mut (dyn Write + Send),
    ) -> Result<()> {
        match (CopyTarget::parse(src), CopyTarget::parse(dst)) {
            (CopyTarget::Container { query, path }, CopyTarget::Host(host)) => {
                let from = self.container_fs(&query).await?.find(&path)?;
                copy_path(&from, &host)?;
            }
            (CopyTarget::Container { query, path }, CopyTarget::Stream) => {
                let from = self.container_fs(&query).await?.find(&path)?;
                pack(&from, stdout)?;
            }
            (CopyTarget::Host(host), CopyTarget::Container { query, path }) => {
                let cfs = self.container_fs(&query).await?;
                let to = secure_join(cfs.top()?, Path::new(&path))?;
                copy_path(&host, &to)?;
            }
            (CopyTarget::Stream, CopyTarget::Container { query, path }) => {
                let cfs = self.container_fs(&query).await?;
                let to = secure_join(cfs.top()?, Path::new(&path))?;
                fs::create_dir_all(&to)?;
                unpack(stdin, &to)?;
            }
            (CopyTarget::Container { .. }, CopyTarget::Container { .. }) => {
                return Err(CtlError::usage("copying between containers is not supported"))
            }
            _ => {
                return Err(CtlError::usage(
                    "one of the paths must refer to a container, as CONTAINER:PATH",
                ))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{manager, options};
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(CopyTarget::parse("-"), CopyTarget::Stream);
        assert_eq!(
            CopyTarget::parse("web:/etc/hosts"),
            CopyTarget::Container {
                query: "web".into(),
                path: "/etc/hosts".into()
            }
        );
        assert_eq!(CopyTarget::parse("./a:b"), CopyTarget::Host("./a:b".into()));
        assert_eq!(CopyTarget::parse("/tmp/x"), CopyTarget::Host("/tmp/x".into()));
    }

    #[tokio::test]
    async fn test_copy_in_and_out() {
        let (manager, _runtime, temp) = manager();
        let mut opts = options(&["true"]);
        opts.name = Some("files".into());
        manager.create(&opts).await.unwrap();

        let host = temp.path().join("host");
        fs::create_dir_all(host.join("conf")).unwrap();
        fs::write(host.join("conf/app.toml"), "port = 80\n").unwrap();
        let src = host.join("conf");
        let mut stdin = std::io::empty();
        let mut stdout = Vec::new();
        manager
            .cp(src.to_str().unwrap(), "files:/etc", &mut stdin, &mut stdout)
            .await
            .unwrap();

        let out = temp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        manager
            .cp("files:/etc/conf/app.toml", out.to_str().unwrap(), &mut stdin, &mut stdout)
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(out.join("app.toml")).unwrap(), "port = 80\n");

        manager
            .cp("files:/etc/passwd", "-", &mut stdin, &mut stdout)
            .await
            .unwrap();
        let mut archive = tar::Archive::new(stdout.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["passwd".to_string()]);
    }

    #[tokio::test]
    async fn test_copy_cannot_escape_root() {
        let (manager, _runtime, temp) = manager();
        let mut opts = options(&["true"]);
        opts.name = Some("jail".into());
        let record = manager.create(&opts).await.unwrap();

        let host = temp.path().join("payload");
        fs::write(&host, "x").unwrap();
        let mut stdin = std::io::empty();
        let mut stdout = Vec::new();
        manager
            .cp(host.to_str().unwrap(), "jail:/../../escaped", &mut stdin, &mut stdout)
            .await
            .unwrap();
        assert!(!temp.path().join("escaped").exists());
        let mounts = manager
            .runtime()
            .snapshot_mounts("default", &record.snapshotter, &record.snapshot_key)
            .await
            .unwrap();
        assert!(Path::new(&mounts[0].source).join("escaped").exists());
    }

    #[tokio::test]
    async fn test_copy_needs_one_container() {
        let (manager, _runtime, _temp) = manager();
        let mut stdin = std::io::empty();
        let mut stdout = Vec::new();
        assert!(manager
            .cp("/tmp/a", "/tmp/b", &mut stdin, &mut stdout)
            .await
            .is_err());
    }
}
