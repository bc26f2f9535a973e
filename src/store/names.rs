//! Name store
//!
//! A name binding is a file `names/<kind>/<name>` whose content is the object
//! ID. Every mutation holds an exclusive lock on the `<kind>` directory, so
//! concurrent clients on the same host observe reserve/release/rename as
//! atomic.

use super::lock::with_dir_lock;
use super::write_atomic;
use crate::error::{CtlError, ObjectKind, Result};
use std::path::{Path, PathBuf};

/// Per-namespace name to ID bindings
#[derive(Debug, Clone)]
pub struct NameStore {
    root: PathBuf,
}

impl NameStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn kind_dir(&self, kind: ObjectKind) -> PathBuf {
        let sub = match kind {
            ObjectKind::Container => "containers",
            ObjectKind::Image => "images",
            ObjectKind::Network => "networks",
            ObjectKind::Volume => "volumes",
        };
        self.root.join(sub)
    }

    /// Bind `name` to `id`. Reserving a name already bound to the same ID is a no-op.
    pub fn reserve(&self, kind: ObjectKind, name: &str, id: &str) -> Result<()> {
        validate_name(name)?;
        let dir = self.kind_dir(kind);
        with_dir_lock(&dir, || {
            let path = dir.join(name);
            match read_binding(&path)? {
                Some(existing) if existing == id => Ok(()),
                Some(existing) => Err(CtlError::NameConflict {
                    kind,
                    name: name.to_string(),
                    id: existing,
                }),
                None => write_atomic(&path, id.as_bytes()),
            }
        })
    }

    /// Drop the binding of `name` if it belongs to `id`; otherwise do nothing
    pub fn release(&self, kind: ObjectKind, name: &str, id: &str) -> Result<()> {
        validate_name(name)?;
        let dir = self.kind_dir(kind);
        with_dir_lock(&dir, || {
            let path = dir.join(name);
            match read_binding(&path)? {
                Some(existing) if existing == id => {
                    std::fs::remove_file(&path)?;
                    Ok(())
                }
                Some(existing) => {
                    tracing::debug!(
                        "not releasing {} name {}: bound to {}, not {}",
                        kind,
                        name,
                        existing,
                        id
                    );
                    Ok(())
                }
                None => Ok(()),
            }
        })
    }

    /// The ID currently bound to `name`
    pub fn lookup(&self, kind: ObjectKind, name: &str) -> Result<Option<String>> {
        if validate_name(name).is_err() {
            return Ok(None);
        }
        read_binding(&self.kind_dir(kind).join(name))
    }

    /// Move the binding of `id` from `old` to `new` in one locked step
    pub fn rename(&self, kind: ObjectKind, old: &str, new: &str, id: &str) -> Result<()> {
        validate_name(old)?;
        validate_name(new)?;
        let dir = self.kind_dir(kind);
        with_dir_lock(&dir, || {
            let old_path = dir.join(old);
            let new_path = dir.join(new);
            match read_binding(&old_path)? {
                Some(existing) if existing == id => {}
                Some(existing) => {
                    return Err(CtlError::NameConflict {
                        kind,
                        name: old.to_string(),
                        id: existing,
                    })
                }
                None => return Err(CtlError::not_found(kind, old)),
            }
            if old == new {
                return Ok(());
            }
            if let Some(existing) = read_binding(&new_path)? {
                if existing != id {
                    return Err(CtlError::NameConflict {
                        kind,
                        name: new.to_string(),
                        id: existing,
                    });
                }
            }
            write_atomic(&new_path, id.as_bytes())?;
            std::fs::remove_file(&old_path)?;
            Ok(())
        })
    }

    /// All bindings of a kind, sorted by name
    pub fn list(&self, kind: ObjectKind) -> Result<Vec<(String, String)>> {
        let dir = self.kind_dir(kind);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut bindings = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = read_binding(&entry.path())? {
                bindings.push((name, id));
            }
        }
        bindings.sort();
        Ok(bindings)
    }
}

fn read_binding(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(id) => Ok(Some(id.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Names must be a single, printable path component
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| CtlError::InvalidPath {
        path: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.contains('/') {
        return Err(invalid("name contains '/'"));
    }
    if name.contains("..") || name == "." {
        return Err(invalid("name contains a relative path component"));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(invalid("name contains control characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_reserve_is_idempotent_for_same_id() {
        let temp = tempdir().unwrap();
        let names = NameStore::new(temp.path().to_path_buf());

        names.reserve(ObjectKind::Container, "web", "id-1").unwrap();
        names.reserve(ObjectKind::Container, "web", "id-1").unwrap();

        let err = names
            .reserve(ObjectKind::Container, "web", "id-2")
            .unwrap_err();
        assert!(matches!(err, CtlError::NameConflict { ref id, .. } if id == "id-1"));
    }

    #[test]
    fn test_kinds_are_independent() {
        let temp = tempdir().unwrap();
        let names = NameStore::new(temp.path().to_path_buf());

        names.reserve(ObjectKind::Container, "data", "c1").unwrap();
        names.reserve(ObjectKind::Volume, "data", "v1").unwrap();
        assert_eq!(
            names.lookup(ObjectKind::Volume, "data").unwrap(),
            Some("v1".to_string())
        );
    }

    #[test]
    fn test_concurrent_reserve_single_winner() {
        let temp = tempdir().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let root = temp.path().to_path_buf();
                std::thread::spawn(move || {
                    NameStore::new(root)
                        .reserve(ObjectKind::Container, "web", &format!("id-{}", i))
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_release_then_reserve_by_other() {
        let temp = tempdir().unwrap();
        let names = NameStore::new(temp.path().to_path_buf());

        names.reserve(ObjectKind::Container, "web", "id-1").unwrap();
        names.release(ObjectKind::Container, "web", "id-1").unwrap();
        names.release(ObjectKind::Container, "web", "id-1").unwrap();
        names.reserve(ObjectKind::Container, "web", "id-2").unwrap();

        names.release(ObjectKind::Container, "web", "id-1").unwrap();
        assert_eq!(
            names.lookup(ObjectKind::Container, "web").unwrap(),
            Some("id-2".to_string())
        );
    }

    #[test]
    fn test_rename_round_trip() {
        let temp = tempdir().unwrap();
        let names = NameStore::new(temp.path().to_path_buf());

        names.reserve(ObjectKind::Container, "a", "id-1").unwrap();
        names.rename(ObjectKind::Container, "a", "b", "id-1").unwrap();
        assert_eq!(names.lookup(ObjectKind::Container, "a").unwrap(), None);
        names.rename(ObjectKind::Container, "b", "a", "id-1").unwrap();
        assert_eq!(
            names.list(ObjectKind::Container).unwrap(),
            vec![("a".to_string(), "id-1".to_string())]
        );
    }

    #[test]
    fn test_rename_onto_taken_name_fails() {
        let temp = tempdir().unwrap();
        let names = NameStore::new(temp.path().to_path_buf());

        names.reserve(ObjectKind::Container, "a", "id-1").unwrap();
        names.reserve(ObjectKind::Container, "b", "id-2").unwrap();
        assert!(names.rename(ObjectKind::Container, "a", "b", "id-1").is_err());
        assert_eq!(
            names.lookup(ObjectKind::Container, "a").unwrap(),
            Some("id-1".to_string())
        );
    }

    #[test]
    fn test_path_like_names_refused() {
        let temp = tempdir().unwrap();
        let names = NameStore::new(temp.path().to_path_buf());

        for bad in ["", "a/b", "..", "x..y", "tab\there"] {
            assert!(
                names.reserve(ObjectKind::Container, bad, "id").is_err(),
                "{:?} should be refused",
                bad
            );
        }
    }
}
