//! User mounts: `-v`, `--mount` and `--tmpfs`
//!
//! Mounts are parsed into [`MountPoint`]s, their host side is resolved and
//! created, and the result is deduplicated by destination: the same kind at
//! the same destination is last-wins, a different kind is a conflict.

use crate::error::{CtlError, Result};
use crate::store::VolumeStore;
use oci_spec::runtime::{Mount, MountBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const MAX_SYMLINK_HOPS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

impl std::fmt::Display for MountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountKind::Bind => write!(f, "bind"),
            MountKind::Volume => write!(f, "volume"),
            MountKind::Tmpfs => write!(f, "tmpfs"),
        }
    }
}

/// One resolved user mount, also stored on the container as a label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    #[serde(rename = "Type")]
    pub kind: MountKind,
    /// Volume name; empty for binds and tmpfs
    #[serde(rename = "Name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "Source")]
    pub source: PathBuf,
    #[serde(rename = "Destination")]
    pub destination: PathBuf,
    #[serde(rename = "RW")]
    pub rw: bool,
    #[serde(rename = "Options", default)]
    pub options: Vec<String>,
}

/// Mount flags as typed by the user
#[derive(Debug, Clone, Default)]
pub struct MountRequests {
    pub volumes: Vec<String>,
    pub mounts: Vec<String>,
    pub tmpfs: Vec<String>,
}

/// Outcome of mount resolution
#[derive(Debug, Default)]
pub struct ResolvedMounts {
    pub mounts: Vec<MountPoint>,
    /// Anonymous volumes created for this container
    pub anonymous: Vec<String>,
    /// Named volumes that did not exist before
    pub created: Vec<String>,
}

/// A mount before its host side has been resolved
#[derive(Debug, Clone, PartialEq, Eq)]
enum Parsed {
    Bind {
        source: String,
        destination: String,
        options: Vec<String>,
        create: bool,
    },
    Volume {
        name: Option<String>,
        destination: String,
        options: Vec<String>,
    },
    Tmpfs {
        destination: String,
        options: Vec<String>,
    },
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('/') || source.starts_with("./") || source.starts_with("../") || source == "." || source == ".."
}

fn check_destination(destination: &str) -> Result<()> {
    if !destination.starts_with('/') {
        return Err(CtlError::InvalidPath {
            path: destination.to_string(),
            reason: "mount destination must be an absolute path".to_string(),
        });
    }
    Ok(())
}

fn mount_options(opts: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        match opt {
            "ro" | "rw" | "z" | "Z" | "shared" | "rshared" | "slave" | "rslave" | "private"
            | "rprivate" | "bind" | "rbind" | "nocopy" => out.push(opt.to_string()),
            other => {
                return Err(CtlError::usage(format!("unknown mount option {:?}", other)))
            }
        }
    }
    Ok(out)
}

/// Parse `-v [src:]dst[:opts]`
fn parse_volume_flag(value: &str) -> Result<Parsed> {
    let parts: Vec<&str> = value.split(':').collect();
    let (source, destination, options) = match parts.as_slice() {
        [dst] => (None, *dst, Vec::new()),
        [src, dst] if dst.starts_with('/') => (Some(*src), *dst, Vec::new()),
        [dst, opts] => (None, *dst, mount_options(opts)?),
        [src, dst, opts] => (Some(*src), *dst, mount_options(opts)?),
        _ => return Err(CtlError::usage(format!("invalid volume specification {:?}", value))),
    };
    check_destination(destination)?;
    Ok(match source {
        None => Parsed::Volume {
            name: None,
            destination: destination.to_string(),
            options,
        },
        Some(src) if is_host_path(src) => Parsed::Bind {
            source: src.to_string(),
            destination: destination.to_string(),
            options,
            create: true,
        },
        Some(name) => Parsed::Volume {
            name: Some(name.to_string()),
            destination: destination.to_string(),
            options,
        },
    })
}

/// Parse `--mount type=...,source=...,target=...[,readonly]`
fn parse_mount_flag(value: &str) -> Result<Parsed> {
    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    let mut readonly = false;
    for field in value.split(',').filter(|f| !f.is_empty()) {
        match field.split_once('=') {
            Some((k, v)) => {
                let k = k.trim().to_ascii_lowercase();
                if matches!(k.as_str(), "readonly" | "ro") {
                    readonly = v != "false" && v != "0";
                } else {
                    fields.insert(k, v.trim().to_string());
                }
            }
            None if matches!(field, "readonly" | "ro") => readonly = true,
            None => {
                return Err(CtlError::usage(format!("invalid mount field {:?} in {:?}", field, value)))
            }
        }
    }
    let get = |keys: &[&str]| keys.iter().find_map(|k| fields.get(*k).cloned());
    let destination = get(&["target", "destination", "dst"])
        .ok_or_else(|| CtlError::usage(format!("mount {:?} is missing a target", value)))?;
    check_destination(&destination)?;
    let source = get(&["source", "src"]);
    let mut options = Vec::new();
    if readonly {
        options.push("ro".to_string());
    }

    match get(&["type"]).as_deref().unwrap_or("volume") {
        "bind" => {
            let source = source
                .ok_or_else(|| CtlError::usage(format!("bind mount {:?} is missing a source", value)))?;
            if let Some(propagation) = get(&["bind-propagation"]) {
                options.extend(mount_options(&propagation)?);
            }
            Ok(Parsed::Bind {
                source,
                destination,
                options,
                create: false,
            })
        }
        "volume" => Ok(Parsed::Volume {
            name: source,
            destination,
            options,
        }),
        "tmpfs" => {
            if source.is_some() {
                return Err(CtlError::usage("tmpfs mounts do not take a source"));
            }
            if let Some(size) = get(&["tmpfs-size"]) {
                options.push(format!("size={}", super::resources::parse_size(&size)?));
            }
            if let Some(mode) = get(&["tmpfs-mode"]) {
                u32::from_str_radix(&mode, 8)
                    .map_err(|_| CtlError::usage(format!("invalid tmpfs-mode {:?}", mode)))?;
                options.push(format!("mode={}", mode));
            }
            Ok(Parsed::Tmpfs {
                destination,
                options,
            })
        }
        other => Err(CtlError::usage(format!("unsupported mount type {:?}", other))),
    }
}

/// Parse `--tmpfs dst[:opts]`
fn parse_tmpfs_flag(value: &str) -> Result<Parsed> {
    let (destination, opts) = value.split_once(':').unwrap_or((value, ""));
    check_destination(destination)?;
    let mut options: Vec<String> = opts
        .split(',')
        .filter(|o| !o.is_empty())
        .map(String::from)
        .collect();
    if !options.iter().any(|o| o.starts_with("mode=")) {
        options.push("mode=1777".to_string());
    }
    Ok(Parsed::Tmpfs {
        destination: destination.to_string(),
        options,
    })
}

/// Lexically clean an absolute container path
pub fn clean_path(path: &str) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

/// Resolve a host path given on the command line
///
/// Relative paths are anchored at `cwd`. A `..` that climbs out of the
/// anchor (`/` for absolute paths) is rejected instead of clamped.
pub fn resolve_host_path(source: &str, cwd: &Path) -> Result<PathBuf> {
    let (mut out, floor) = if source.starts_with('/') {
        (PathBuf::from("/"), 1)
    } else {
        (cwd.to_path_buf(), cwd.components().count())
    };
    for component in Path::new(source).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if out.components().count() <= floor {
                    return Err(CtlError::InvalidPath {
                        path: source.to_string(),
                        reason: "path escapes the mount root".to_string(),
                    });
                }
                out.pop();
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Join `unsafe_path` onto `root`, resolving symlinks as if `root` were `/`
///
/// The result always lies inside `root`: `..` and absolute symlink targets are
/// clamped at the root instead of escaping it.
pub fn secure_join(root: &Path, unsafe_path: &Path) -> Result<PathBuf> {
    let mut pending: Vec<std::ffi::OsString> = Vec::new();
    push_components(&mut pending, unsafe_path);
    let mut resolved: Vec<std::ffi::OsString> = Vec::new();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let mut candidate = root.to_path_buf();
        candidate.extend(resolved.iter());
        candidate.push(&part);
        match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(CtlError::InvalidPath {
                        path: unsafe_path.display().to_string(),
                        reason: "too many levels of symbolic links".to_string(),
                    });
                }
                let target = std::fs::read_link(&candidate)?;
                if target.is_absolute() {
                    resolved.clear();
                }
                push_components(&mut pending, &target);
            }
            _ => resolved.push(part),
        }
    }

    let mut out = root.to_path_buf();
    out.extend(resolved.iter());
    Ok(out)
}

/// Push the components of `path` so that popping yields them in order
fn push_components(stack: &mut Vec<std::ffi::OsString>, path: &Path) {
    let parts: Vec<std::ffi::OsString> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_os_string()),
            Component::ParentDir => Some("..".into()),
            _ => None,
        })
        .collect();
    stack.extend(parts.into_iter().rev());
}

fn is_readonly(options: &[String]) -> bool {
    options.iter().any(|o| o == "ro")
}

/// Parse, resolve and deduplicate the user's mounts
///
/// `image_volumes` are the image's `VOLUME` entries; each one that no user
/// mount covers gets an anonymous volume.
pub fn resolve(
    requests: &MountRequests,
    image_volumes: &[String],
    volumes: &VolumeStore,
    cwd: &Path,
) -> Result<ResolvedMounts> {
    let mut parsed = Vec::new();
    for v in &requests.volumes {
        parsed.push(parse_volume_flag(v)?);
    }
    for m in &requests.mounts {
        parsed.push(parse_mount_flag(m)?);
    }
    for t in &requests.tmpfs {
        parsed.push(parse_tmpfs_flag(t)?);
    }

    // Dedup before touching the host so a rejected set creates nothing.
    let mut by_dest: Vec<(PathBuf, MountKind, Parsed)> = Vec::new();
    for p in parsed {
        let (kind, dest) = match &p {
            Parsed::Bind { destination, .. } => (MountKind::Bind, destination),
            Parsed::Volume { destination, .. } => (MountKind::Volume, destination),
            Parsed::Tmpfs { destination, .. } => (MountKind::Tmpfs, destination),
        };
        let dest = clean_path(dest);
        match by_dest.iter_mut().find(|(d, _, _)| *d == dest) {
            Some((_, existing, slot)) if *existing == kind => *slot = p,
            Some((_, existing, _)) => {
                return Err(CtlError::conflict(
                    format!(
                        "duplicate mount point {}: {} mount conflicts with {} mount",
                        dest.display(),
                        kind,
                        existing
                    ),
                    "use a single mount per destination",
                ))
            }
            None => by_dest.push((dest, kind, p)),
        }
    }

    for image_volume in image_volumes {
        let dest = clean_path(image_volume);
        if !by_dest.iter().any(|(d, _, _)| *d == dest) {
            let destination = dest.display().to_string();
            by_dest.push((
                dest,
                MountKind::Volume,
                Parsed::Volume {
                    name: None,
                    destination,
                    options: Vec::new(),
                },
            ));
        }
    }

    // Missing `--mount` bind sources fail before any volume exists.
    for (_, _, p) in &by_dest {
        if let Parsed::Bind {
            source,
            create: false,
            ..
        } = p
        {
            let source = resolve_host_path(source, cwd)?;
            if !source.exists() {
                return Err(missing_bind_source(&source));
            }
        }
    }

    let mut out = ResolvedMounts::default();
    if let Err(e) = materialize(by_dest, volumes, cwd, &mut out) {
        for name in out.anonymous.iter().chain(out.created.iter()) {
            if let Err(err) = volumes.remove(name) {
                warn!("failed to remove volume {} after a failed mount: {}", name, err);
            }
        }
        return Err(e);
    }

    // Parents before children; stable for equal depth.
    out.mounts
        .sort_by_key(|m| m.destination.components().count());
    Ok(out)
}

fn missing_bind_source(source: &Path) -> CtlError {
    CtlError::InvalidPath {
        path: source.display().to_string(),
        reason: "bind source path does not exist".to_string(),
    }
}

/// Create the host side of every mount, recording volumes as they appear
fn materialize(
    by_dest: Vec<(PathBuf, MountKind, Parsed)>,
    volumes: &VolumeStore,
    cwd: &Path,
    out: &mut ResolvedMounts,
) -> Result<()> {
    for (destination, kind, p) in by_dest {
        let mount = match p {
            Parsed::Bind {
                source,
                options,
                create,
                ..
            } => {
                let source = resolve_host_path(&source, cwd)?;
                if !source.exists() {
                    if !create {
                        return Err(missing_bind_source(&source));
                    }
                    std::fs::create_dir_all(&source)?;
                }
                MountPoint {
                    kind,
                    name: String::new(),
                    source,
                    destination,
                    rw: !is_readonly(&options),
                    options,
                }
            }
            Parsed::Volume { name, options, .. } => {
                let volume = match name {
                    Some(name) => match volumes.get(&name) {
                        Ok(volume) => volume,
                        Err(e) if e.is_not_found() => {
                            let volume = volumes.create(Some(&name), BTreeMap::new())?;
                            out.created.push(volume.name.clone());
                            volume
                        }
                        Err(e) => return Err(e),
                    },
                    None => {
                        let volume = volumes.create_anonymous()?;
                        out.anonymous.push(volume.name.clone());
                        volume
                    }
                };
                debug!("mounting volume {} at {}", volume.name, destination.display());
                MountPoint {
                    kind,
                    name: volume.name,
                    source: volume.mountpoint,
                    destination,
                    rw: !is_readonly(&options),
                    options,
                }
            }
            Parsed::Tmpfs { options, .. } => MountPoint {
                kind,
                name: String::new(),
                source: PathBuf::from("tmpfs"),
                destination,
                rw: !is_readonly(&options),
                options,
            },
        };
        out.mounts.push(mount);
    }

    Ok(())
}

/// Convert a mount point into its OCI form
pub fn to_oci(mount: &MountPoint) -> Result<Mount> {
    let mut options: Vec<String> = Vec::new();
    let typ = match mount.kind {
        MountKind::Tmpfs => {
            options.extend(["nosuid".to_string(), "nodev".to_string(), "noexec".to_string()]);
            "tmpfs"
        }
        MountKind::Bind | MountKind::Volume => {
            if !mount.options.iter().any(|o| o == "bind") {
                options.push("rbind".to_string());
            }
            "bind"
        }
    };
    for opt in &mount.options {
        if opt != "rw" && opt != "ro" && opt != "nocopy" && !options.contains(opt) {
            options.push(opt.clone());
        }
    }
    options.push(if mount.rw { "rw" } else { "ro" }.to_string());
    Ok(MountBuilder::default()
        .destination(mount.destination.clone())
        .typ(typ)
        .source(mount.source.clone())
        .options(options)
        .build()?)
}

/// Bind mount of a runectl-managed file (hosts, resolv.conf, hostname)
pub fn file_bind(source: &Path, destination: &str, readonly: bool) -> Result<Mount> {
    Ok(MountBuilder::default()
        .destination(PathBuf::from(destination))
        .typ("bind")
        .source(source.to_path_buf())
        .options(vec![
            "rbind".to_string(),
            "rprivate".to_string(),
            if readonly { "ro" } else { "rw" }.to_string(),
        ])
        .build()?)
}

/// Names of the volumes a set of mount points references
pub fn volume_names(mounts: &[MountPoint]) -> Vec<String> {
    mounts
        .iter()
        .filter(|m| m.kind == MountKind::Volume)
        .map(|m| m.name.clone())
        .collect()
}

/// Reject removal of a volume still referenced by containers
pub fn check_not_in_use(name: &str, users: Vec<String>) -> Result<()> {
    if users.is_empty() {
        Ok(())
    } else {
        Err(CtlError::VolumeInUse {
            name: name.to_string(),
            containers: users,
        })
    }
}
