//! Environment merging
//!
//! Image env, then `--env-file` lines, then `--env` flags; later entries win
//! and each key appears once, at the position where it was first set.

use crate::error::{CtlError, Result};
use std::path::Path;

/// `PATH` used when neither the image nor the user sets one
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Resolve one `KEY=VALUE` or `KEY` entry
///
/// A bare `KEY` takes the value from `lookup`; when that yields nothing the
/// entry is dropped rather than set empty.
pub fn resolve_entry(
    entry: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<String>> {
    let (key, value) = match entry.split_once('=') {
        Some((key, value)) => (key, Some(value.to_string())),
        None => (entry, None),
    };
    validate_key(key, entry)?;
    Ok(match value {
        Some(value) => Some(format!("{}={}", key, value)),
        None => lookup(key).map(|value| format!("{}={}", key, value)),
    })
}

fn validate_key(key: &str, entry: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CtlError::usage(format!(
            "invalid environment variable {:?}: empty key",
            entry
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c == '\0') {
        return Err(CtlError::usage(format!(
            "invalid environment variable {:?}: key contains whitespace",
            entry
        )));
    }
    Ok(())
}

/// Parse the lines of an env file; `#` comments and blank lines are skipped
pub fn parse_env_file_content(
    content: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(entry) = resolve_entry(line, &lookup)? {
            out.push(entry);
        }
    }
    Ok(out)
}

pub fn parse_env_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CtlError::usage(format!("failed to read env file {}: {}", path.display(), e))
    })?;
    parse_env_file_content(&content, host_lookup)
}

/// Environment of the client process
pub fn host_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Merge entries with last-wins semantics
pub fn merge<I, S>(layers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for entry in layers {
        let entry = entry.as_ref();
        let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(entry);
        match out
            .iter_mut()
            .find(|e| e.split_once('=').map(|(k, _)| k).unwrap_or(e) == key)
        {
            Some(existing) => *existing = entry.to_string(),
            None => out.push(entry.to_string()),
        }
    }
    out
}

/// The full container environment
///
/// `extra` carries entries the assembler adds itself (`HOSTNAME`, `TERM`),
/// which the user may still override.
pub fn build(
    image_env: &[String],
    env_files: &[std::path::PathBuf],
    env_flags: &[String],
    extra: &[String],
) -> Result<Vec<String>> {
    let mut layers: Vec<String> = Vec::new();
    if !image_env.iter().any(|e| e.starts_with("PATH=")) {
        layers.push(format!("PATH={}", DEFAULT_PATH));
    }
    layers.extend(image_env.iter().cloned());
    layers.extend(extra.iter().cloned());
    layers.extend(user_entries(env_files, env_flags)?);
    Ok(merge(layers))
}

/// Entries from `--env-file` then `--env`, in order
pub fn user_entries(env_files: &[std::path::PathBuf], env_flags: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for file in env_files {
        out.extend(parse_env_file(file)?);
    }
    for flag in env_flags {
        if let Some(entry) = resolve_entry(flag, host_lookup)? {
            out.push(entry);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lookup(key: &str) -> Option<String> {
        match key {
            "HOME_DIR" => Some("/home/me".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_env_file_lines() {
        let content = "# comment\n\nFOO=bar\nHOME_DIR\nUNSET_KEY\nEMPTY=\n  SPACED=1\n";
        let env = parse_env_file_content(content, lookup).unwrap();
        assert_eq!(env, vec!["FOO=bar", "HOME_DIR=/home/me", "EMPTY=", "SPACED=1"]);
    }

    #[test]
    fn test_invalid_keys_rejected() {
        assert!(resolve_entry("=value", lookup).is_err());
        assert!(resolve_entry("BAD KEY=1", lookup).is_err());
        assert_eq!(
            resolve_entry("A=b=c", lookup).unwrap().as_deref(),
            Some("A=b=c")
        );
    }

    #[test]
    fn test_merge_last_wins_in_place() {
        let merged = merge(["A=1", "B=2", "A=3", "C=4", "B=5"]);
        assert_eq!(merged, vec!["A=3", "B=5", "C=4"]);
    }

    #[test]
    fn test_build_layers() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("app.env");
        std::fs::write(&file, "MODE=file\nLEVEL=debug\n").unwrap();

        let env = build(
            &["PATH=/bin".to_string(), "MODE=image".to_string()],
            &[file],
            &["MODE=flag".to_string()],
            &["HOSTNAME=c1".to_string()],
        )
        .unwrap();
        assert_eq!(env, vec!["PATH=/bin", "MODE=flag", "HOSTNAME=c1", "LEVEL=debug"]);

        let env = build(&[], &[], &[], &[]).unwrap();
        assert_eq!(env, vec![format!("PATH={}", DEFAULT_PATH)]);
    }
}
