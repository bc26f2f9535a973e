//! Container state and creation options

use crate::error::{CtlError, Result};
use crate::image::PullPolicy;
use crate::runtime::TaskStatus;
use crate::spec::mounts::MountRequests;
use crate::spec::resources::ResourceOptions;
use crate::spec::security::SecurityOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Container status as shown by `ps` and `inspect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but its process never ran
    Created,
    /// Container is running
    Running,
    /// Container is paused
    Paused,
    /// Container has exited
    Exited,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Exited => write!(f, "exited"),
        }
    }
}

/// Container and task folded into one view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub status: ContainerStatus,
    /// 0 unless running or paused
    pub pid: u32,
    pub exit_code: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self.status, ContainerStatus::Running | ContainerStatus::Paused)
    }

    /// `Up 3 minutes`, `Exited (123) 2 seconds ago`, `Created`
    pub fn describe(&self, now: DateTime<Utc>) -> String {
        match self.status {
            ContainerStatus::Created => "Created".to_string(),
            ContainerStatus::Running | ContainerStatus::Paused => {
                let up = self
                    .started_at
                    .map(|t| format!("Up {}", human_duration(now - t)))
                    .unwrap_or_else(|| "Up".to_string());
                if self.status == ContainerStatus::Paused {
                    format!("{} (Paused)", up)
                } else {
                    up
                }
            }
            ContainerStatus::Exited => match self.finished_at {
                Some(t) => format!(
                    "Exited ({}) {} ago",
                    self.exit_code,
                    human_duration(now - t)
                ),
                None => format!("Exited ({})", self.exit_code),
            },
        }
    }
}

impl From<TaskStatus> for ContainerStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Created => ContainerStatus::Created,
            TaskStatus::Running => ContainerStatus::Running,
            TaskStatus::Paused => ContainerStatus::Paused,
            TaskStatus::Stopped => ContainerStatus::Exited,
        }
    }
}

/// `Less than a second`, `5 seconds`, `About a minute`, `3 hours`
pub fn human_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds();
    match secs {
        s if s < 1 => "Less than a second".to_string(),
        1 => "1 second".to_string(),
        s if s < 60 => format!("{} seconds", s),
        s if s < 120 => "About a minute".to_string(),
        s if s < 3600 => format!("{} minutes", s / 60),
        s if s < 7200 => "About an hour".to_string(),
        s if s < 48 * 3600 => format!("{} hours", s / 3600),
        s => format!("{} days", s / 86400),
    }
}

/// `--restart` policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    /// Optional maximum retry count
    OnFailure(Option<u32>),
    UnlessStopped,
}

impl FromStr for RestartPolicy {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            None => match s {
                "" | "no" => Ok(RestartPolicy::No),
                "always" => Ok(RestartPolicy::Always),
                "on-failure" => Ok(RestartPolicy::OnFailure(None)),
                "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
                other => Err(CtlError::usage(format!(
                    "invalid restart policy {:?}",
                    other
                ))),
            },
            Some(("on-failure", count)) => count
                .parse()
                .map(|n| RestartPolicy::OnFailure(Some(n)))
                .map_err(|_| CtlError::usage(format!("invalid restart count {:?}", count))),
            Some(_) => Err(CtlError::usage(format!(
                "invalid restart policy {:?}, only on-failure takes a count",
                s
            ))),
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure(None) => write!(f, "on-failure"),
            RestartPolicy::OnFailure(Some(n)) => write!(f, "on-failure:{}", n),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
        }
    }
}

/// Flags of `create` and `run`
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub image: String,
    pub args: Vec<String>,
    pub name: Option<String>,
    pub entrypoint: Option<String>,

    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub group_add: Vec<String>,

    pub tty: bool,
    pub interactive: bool,
    pub detach: bool,
    pub rm: bool,
    pub detach_keys: Option<String>,

    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub networks: Vec<String>,
    pub publish: Vec<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub dns_options: Vec<String>,
    pub add_hosts: Vec<String>,

    pub mounts: MountRequests,
    pub read_only: bool,
    pub shm_size: Option<String>,
    pub resources: ResourceOptions,
    pub security: SecurityOptions,

    pub labels: BTreeMap<String, String>,
    pub log_driver: Option<String>,
    pub log_opts: Vec<String>,
    pub restart: RestartPolicy,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<u64>,

    pub pull: PullPolicy,
    pub platform: Option<String>,
}

impl CreateOptions {
    pub fn new(image: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            image: image.into(),
            args,
            ..Default::default()
        }
    }

    /// Reject flag combinations that cannot work together
    pub fn validate(&self) -> Result<()> {
        if self.image.is_empty() {
            return Err(CtlError::usage("an image is required"));
        }
        if self.rm && self.restart != RestartPolicy::No {
            return Err(CtlError::usage(format!(
                "--rm cannot be combined with --restart={}",
                self.restart
            )));
        }
        if self.rm && self.detach {
            return Err(CtlError::usage("--rm and --detach cannot be combined"));
        }
        if let Some(name) = &self.name {
            if !super::is_valid_name(name) {
                return Err(CtlError::usage(format!(
                    "invalid container name {:?}, must match [a-zA-Z0-9][a-zA-Z0-9_.-]+",
                    name
                )));
            }
        }
        for host in &self.add_hosts {
            parse_extra_host(host)?;
        }
        Ok(())
    }
}

/// Parse `KEY=VALUE` labels; a bare `KEY` gets an empty value
pub fn parse_labels(values: &[String]) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for value in values {
        let (key, val) = value.split_once('=').unwrap_or((value.as_str(), ""));
        if key.is_empty() {
            return Err(CtlError::usage(format!("invalid label {:?}", value)));
        }
        labels.insert(key.to_string(), val.to_string());
    }
    Ok(labels)
}

/// `--add-host name:ip`
pub fn parse_extra_host(value: &str) -> Result<(String, String)> {
    let invalid = || CtlError::usage(format!("invalid --add-host {:?}, expected name:ip", value));
    let (name, ip) = value.split_once(':').ok_or_else(invalid)?;
    if name.is_empty() || ip.parse::<std::net::IpAddr>().is_err() {
        return Err(invalid());
    }
    Ok((name.to_string(), ip.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_restart_policy() {
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::No);
        assert_eq!(
            "on-failure:3".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure(Some(3))
        );
        assert_eq!(RestartPolicy::OnFailure(Some(3)).to_string(), "on-failure:3");
        assert!("always:2".parse::<RestartPolicy>().is_err());
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_validate_combinations() {
        let mut opts = CreateOptions::new("alpine", vec![]);
        opts.rm = true;
        assert!(opts.validate().is_ok());
        opts.restart = RestartPolicy::Always;
        assert!(opts.validate().is_err());
        opts.restart = RestartPolicy::No;
        opts.detach = true;
        assert!(opts.validate().is_err());

        let mut opts = CreateOptions::new("alpine", vec![]);
        opts.name = Some("-bad".into());
        assert!(opts.validate().is_err());
        opts.name = Some("web.1".into());
        opts.add_hosts = vec!["db:not-an-ip".into()];
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_describe_state() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let state = ContainerState {
            status: ContainerStatus::Exited,
            pid: 0,
            exit_code: 123,
            started_at: None,
            finished_at: Some(now - chrono::Duration::seconds(2)),
        };
        assert_eq!(state.describe(now), "Exited (123) 2 seconds ago");

        let state = ContainerState {
            status: ContainerStatus::Paused,
            pid: 42,
            exit_code: 0,
            started_at: Some(now - chrono::Duration::minutes(3)),
            finished_at: None,
        };
        assert_eq!(state.describe(now), "Up 3 minutes (Paused)");
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels(&["a=1".into(), "b".into()]).unwrap();
        assert_eq!(labels["a"], "1");
        assert_eq!(labels["b"], "");
        assert!(parse_labels(&["=x".into()]).is_err());
    }
}
