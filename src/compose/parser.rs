//! Compose file discovery, interpolation and validation

use super::config::ComposeConfig;
use crate::error::{CtlError, Result};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// File names looked up in the project directory, in order
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// First default compose file present in `dir`
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Read, interpolate against the process environment, parse and validate
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CtlError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut env: HashMap<String, String> = std::env::vars().collect();
        if let Some(dir) = path.parent() {
            // `.env` next to the file fills in what the shell does not set.
            for (k, v) in read_dotenv(&dir.join(".env"))? {
                env.entry(k).or_insert(v);
            }
        }
        Self::parse_str(&content, &env)
    }

    pub fn parse_str(content: &str, env: &HashMap<String, String>) -> Result<ComposeConfig> {
        let content = interpolate(content, env)?;
        let config: ComposeConfig = serde_yaml::from_str(&content)
            .map_err(|e| CtlError::InvalidConfig(format!("compose file: {}", e)))?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Structural checks; dependency cycles are left to the sequencer
    pub fn validate(config: &ComposeConfig) -> Result<()> {
        if config.services.is_empty() {
            return Err(CtlError::InvalidConfig(
                "compose file defines no services".to_string(),
            ));
        }
        for (name, service) in &config.services {
            if service.image.is_none() && service.build.is_none() {
                return Err(CtlError::InvalidConfig(format!(
                    "service {:?} has neither an image nor a build context",
                    name
                )));
            }
            for dep in service.dependencies() {
                if !config.services.contains_key(&dep) {
                    return Err(CtlError::InvalidConfig(format!(
                        "service {:?} depends on undefined service {:?}",
                        name, dep
                    )));
                }
            }
            if service.network_mode.is_none() {
                for net in service.network_keys() {
                    if net != "default" && !config.networks.contains_key(&net) {
                        return Err(CtlError::InvalidConfig(format!(
                            "service {:?} refers to undefined network {:?}",
                            name, net
                        )));
                    }
                }
            }
            if service.container_name.is_some() && service.replicas() > 1 {
                return Err(CtlError::InvalidConfig(format!(
                    "service {:?} sets container_name and cannot be scaled",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Project name: explicit, else the compose file's directory name, lowercased
/// and stripped to `[a-z0-9_-]`
pub fn project_name(explicit: Option<&str>, config: &ComposeConfig, dir: &Path) -> Result<String> {
    let raw = explicit
        .map(str::to_string)
        .or_else(|| config.name.clone())
        .or_else(|| {
            dir.canonicalize()
                .ok()
                .and_then(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
        })
        .unwrap_or_default();
    let name: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let name = name.trim_start_matches(['_', '-']).to_string();
    if name.is_empty() {
        return Err(CtlError::usage(format!(
            "cannot derive a project name from {:?}, use --project-name",
            raw
        )));
    }
    Ok(name)
}

fn read_dotenv(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        .collect())
}

fn variable_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?])([^}]*))?\}|([A-Za-z_][A-Za-z0-9_]*))",
            )
            .ok()
        })
        .as_ref()
}

/// Substitute `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
/// `${VAR:?message}` and `$$`
pub fn interpolate(input: &str, env: &HashMap<String, String>) -> Result<String> {
    let pattern =
        variable_pattern().ok_or_else(|| CtlError::internal("invalid interpolation pattern"))?;
    let mut missing: Option<CtlError> = None;
    let out = pattern.replace_all(input, |caps: &Captures| {
        if caps.get(1).is_some() {
            return "$".to_string();
        }
        let name = caps
            .get(2)
            .or_else(|| caps.get(5))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let value = env.get(name);
        match (caps.get(3).map(|m| m.as_str()), caps.get(4).map(|m| m.as_str())) {
            (Some(":-"), Some(default)) => match value {
                Some(v) if !v.is_empty() => v.clone(),
                _ => default.to_string(),
            },
            (Some("-"), Some(default)) => value.cloned().unwrap_or_else(|| default.to_string()),
            (Some(op), message) if op.ends_with('?') => match value {
                Some(v) if !(op == ":?" && v.is_empty()) => v.clone(),
                _ => {
                    missing.get_or_insert_with(|| {
                        CtlError::InvalidConfig(format!(
                            "required variable {} is missing a value: {}",
                            name,
                            message.unwrap_or_default()
                        ))
                    });
                    String::new()
                }
            },
            _ => value.cloned().unwrap_or_default(),
        }
    });
    match missing {
        Some(err) => Err(err),
        None => Ok(out.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_simple_compose() {
        let yaml = r#"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
      - target: 443
        published: 8443
    depends_on: [db]
  db:
    image: postgres:13
    environment:
      POSTGRES_PASSWORD: secret
      PGPORT: 5432
"#;
        let config = ComposeParser::parse_str(yaml, &HashMap::new()).unwrap();
        assert_eq!(config.services.len(), 2);
        let web = &config.services["web"];
        assert_eq!(web.dependencies(), vec!["db"]);
        assert_eq!(web.network_keys(), vec!["default"]);
        let ports: Vec<String> = web
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| p.to_publish())
            .collect();
        assert_eq!(ports, vec!["80:80", "8443:443"]);
    }

    #[test]
    fn test_validate_rejects_bad_files() {
        let no_image = "services:\n  web:\n    ports: [\"80:80\"]\n";
        assert!(ComposeParser::parse_str(no_image, &HashMap::new()).is_err());

        let bad_dep = "services:\n  web:\n    image: nginx\n    depends_on: [cache]\n";
        assert!(ComposeParser::parse_str(bad_dep, &HashMap::new()).is_err());

        let bad_net = "services:\n  web:\n    image: nginx\n    networks: [back]\n";
        assert!(ComposeParser::parse_str(bad_net, &HashMap::new()).is_err());
    }

    #[test]
    fn test_interpolate() {
        let vars = env(&[("TAG", "1.0.0"), ("EMPTY", "")]);
        assert_eq!(interpolate("nginx:${TAG}", &vars).unwrap(), "nginx:1.0.0");
        assert_eq!(interpolate("nginx:$TAG", &vars).unwrap(), "nginx:1.0.0");
        assert_eq!(interpolate("${EMPTY:-x} ${EMPTY-y}", &vars).unwrap(), "x ");
        assert_eq!(interpolate("${NOPE:-fallback}", &vars).unwrap(), "fallback");
        assert_eq!(interpolate("cost $$5", &vars).unwrap(), "cost $5");
        assert!(interpolate("${NOPE:?set it}", &vars).is_err());
    }

    #[test]
    fn test_project_name() {
        let config = ComposeConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("My_App");
        std::fs::create_dir(&app).unwrap();
        assert_eq!(project_name(None, &config, &app).unwrap(), "my_app");
        assert_eq!(project_name(Some("Demo"), &config, &app).unwrap(), "demo");
    }
}
