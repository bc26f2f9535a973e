//! `--user` resolution against the image's passwd and group files
//!
//! The snapshot is never mounted: the files are read straight from the
//! directories the snapshotter reported (a bind source, or an overlay's
//! upperdir followed by each lowerdir).

use crate::error::{CtlError, Result};
use crate::runtime::RootfsMount;
use std::path::{Path, PathBuf};

/// Read-only view of a container root filesystem
#[derive(Debug, Clone, Default)]
pub struct RootfsView {
    layers: Vec<PathBuf>,
}

impl RootfsView {
    pub fn from_mounts(mounts: &[RootfsMount]) -> Self {
        let mut layers = Vec::new();
        for mount in mounts {
            match mount.typ.as_str() {
                "bind" | "rbind" => layers.push(PathBuf::from(&mount.source)),
                "overlay" => {
                    for opt in &mount.options {
                        if let Some(upper) = opt.strip_prefix("upperdir=") {
                            layers.insert(0, PathBuf::from(upper));
                        }
                    }
                    for opt in &mount.options {
                        if let Some(lower) = opt.strip_prefix("lowerdir=") {
                            layers.extend(lower.split(':').map(PathBuf::from));
                        }
                    }
                }
                _ => {}
            }
        }
        Self { layers }
    }

    /// A view over a single directory
    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            layers: vec![path.into()],
        }
    }

    /// Read a file from the topmost layer that has it
    pub fn read(&self, path: &str) -> Option<String> {
        let rel = path.trim_start_matches('/');
        self.layers
            .iter()
            .map(|layer| layer.join(rel))
            .find(|p| p.is_file())
            .and_then(|p| std::fs::read_to_string(p).ok())
    }

    pub fn layers(&self) -> &[PathBuf] {
        &self.layers
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

pub fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: fields.get(5).map(|s| s.to_string()).unwrap_or_default(),
            })
        })
        .collect()
}

pub fn parse_group(content: &str) -> Vec<GroupEntry> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 {
                return None;
            }
            Some(GroupEntry {
                name: fields[0].to_string(),
                gid: fields[2].parse().ok()?,
                members: fields
                    .get(3)
                    .map(|m| {
                        m.split(',')
                            .filter(|s| !s.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Process identity inside the container
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    pub home: Option<String>,
}

/// Resolve `uid`, `uid:gid`, `name` or `name:group`
///
/// Numeric ids never require the passwd file; a bare numeric uid picks up
/// its primary gid from passwd when an entry exists, and 0 otherwise.
/// Names that cannot be looked up fail with `UserNotFound` / `GroupNotFound`.
pub fn resolve(user: Option<&str>, rootfs: &RootfsView, group_add: &[String]) -> Result<ResolvedUser> {
    let passwd = rootfs.read("/etc/passwd").map(|c| parse_passwd(&c));
    let groups = rootfs.read("/etc/group").map(|c| parse_group(&c));

    let user = user.map(str::trim).filter(|u| !u.is_empty()).unwrap_or("0");
    let (user_part, group_part) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };

    let entry = match user_part.parse::<u32>() {
        Ok(uid) => passwd
            .as_ref()
            .and_then(|p| p.iter().find(|e| e.uid == uid).cloned())
            .unwrap_or(PasswdEntry {
                name: String::new(),
                uid,
                gid: 0,
                home: String::new(),
            }),
        Err(_) => passwd
            .as_ref()
            .and_then(|p| p.iter().find(|e| e.name == user_part).cloned())
            .ok_or_else(|| CtlError::UserNotFound(user_part.to_string()))?,
    };

    let gid = match group_part {
        None | Some("") => entry.gid,
        Some(group) => lookup_group(group, groups.as_deref())?,
    };

    let mut additional_gids = Vec::new();
    if !entry.name.is_empty() {
        if let Some(groups) = &groups {
            for g in groups {
                if g.members.iter().any(|m| m == &entry.name) && g.gid != gid {
                    additional_gids.push(g.gid);
                }
            }
        }
    }
    for group in group_add {
        let extra = lookup_group(group, groups.as_deref())?;
        if !additional_gids.contains(&extra) {
            additional_gids.push(extra);
        }
    }

    Ok(ResolvedUser {
        uid: entry.uid,
        gid,
        additional_gids,
        home: (!entry.home.is_empty()).then_some(entry.home),
    })
}

fn lookup_group(group: &str, groups: Option<&[GroupEntry]>) -> Result<u32> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    groups
        .and_then(|g| g.iter().find(|e| e.name == group))
        .map(|e| e.gid)
        .ok_or_else(|| CtlError::GroupNotFound(group.to_string()))
}

/// Whether `path` exists inside the rootfs view (used to validate workdirs)
pub fn exists_in(rootfs: &RootfsView, path: &Path) -> bool {
    let rel = path.strip_prefix("/").unwrap_or(path);
    rootfs.layers().iter().any(|l| l.join(rel).exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/sh\nnobody:x:65534:65534:nobody:/nonexistent:/bin/false\napp:x:1000:1000::/home/app:/bin/sh\n";
    const GROUP: &str = "root:x:0:\nwheel:x:10:app\napp:x:1000:\nnogroup:x:65534:\n";

    fn rootfs(with_files: bool) -> (tempfile::TempDir, RootfsView) {
        let temp = tempdir().unwrap();
        if with_files {
            std::fs::create_dir_all(temp.path().join("etc")).unwrap();
            std::fs::write(temp.path().join("etc/passwd"), PASSWD).unwrap();
            std::fs::write(temp.path().join("etc/group"), GROUP).unwrap();
        }
        let view = RootfsView::dir(temp.path());
        (temp, view)
    }

    #[test]
    fn test_user_forms() {
        let (_t, view) = rootfs(true);
        let root = resolve(None, &view, &[]).unwrap();
        assert_eq!((root.uid, root.gid), (0, 0));
        assert_eq!(root.home.as_deref(), Some("/root"));

        let app = resolve(Some("app"), &view, &[]).unwrap();
        assert_eq!((app.uid, app.gid), (1000, 1000));
        assert_eq!(app.additional_gids, vec![10]);

        let numeric = resolve(Some("1000"), &view, &[]).unwrap();
        assert_eq!(numeric.gid, 1000);

        let pair = resolve(Some("4242:7"), &view, &[]).unwrap();
        assert_eq!((pair.uid, pair.gid), (4242, 7));

        let named_group = resolve(Some("app:nogroup"), &view, &["wheel".to_string(), "99".to_string()]).unwrap();
        assert_eq!(named_group.gid, 65534);
        assert_eq!(named_group.additional_gids, vec![10, 99]);

        assert!(matches!(
            resolve(Some("ghost"), &view, &[]),
            Err(CtlError::UserNotFound(_))
        ));
        assert!(matches!(
            resolve(Some("app:ghosts"), &view, &[]),
            Err(CtlError::GroupNotFound(_))
        ));
    }

    #[test]
    fn test_names_without_passwd_fail() {
        let (_t, view) = rootfs(false);
        assert!(matches!(
            resolve(Some("app"), &view, &[]),
            Err(CtlError::UserNotFound(_))
        ));
        let numeric = resolve(Some("1000"), &view, &[]).unwrap();
        assert_eq!((numeric.uid, numeric.gid), (1000, 0));
    }

    #[test]
    fn test_overlay_layers_order() {
        let temp = tempdir().unwrap();
        let upper = temp.path().join("upper");
        let lower1 = temp.path().join("l1");
        let lower2 = temp.path().join("l2");
        for dir in [&upper, &lower1, &lower2] {
            std::fs::create_dir_all(dir.join("etc")).unwrap();
        }
        std::fs::write(lower2.join("etc/passwd"), "root:x:0:0::/root:/bin/sh\n").unwrap();
        std::fs::write(lower1.join("etc/passwd"), "root:x:0:0::/lower1:/bin/sh\n").unwrap();

        let mounts = vec![RootfsMount {
            typ: "overlay".into(),
            source: "overlay".into(),
            options: vec![
                format!("lowerdir={}:{}", lower1.display(), lower2.display()),
                format!("upperdir={}", upper.display()),
                "workdir=/tmp/work".into(),
            ],
        }];
        let view = RootfsView::from_mounts(&mounts);
        assert_eq!(view.layers()[0], upper);
        assert!(view.read("/etc/passwd").unwrap().contains("/lower1"));
    }
}
