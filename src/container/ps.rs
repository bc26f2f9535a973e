//! `ps`

use super::{labels, ContainerManager, ContainerState, ContainerStatus};
use crate::error::{short_id, CtlError, Result};
use crate::network::PortMapping;
use crate::runtime::ContainerRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// One row of `ps`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    #[serde(rename = "ID")]
    pub id: String,
    pub names: String,
    pub image: String,
    pub command: String,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub state: ContainerStatus,
    pub ports: String,
    pub labels: BTreeMap<String, String>,
}

/// `ps --filter` conditions; all must hold
#[derive(Debug, Clone, Default)]
pub struct PsFilter {
    pub id: Vec<String>,
    pub name: Vec<String>,
    pub status: Vec<String>,
    pub label: Vec<(String, Option<String>)>,
}

impl PsFilter {
    pub fn parse(values: &[String]) -> Result<Self> {
        let mut filter = Self::default();
        for value in values {
            let (key, val) = value.split_once('=').ok_or_else(|| {
                CtlError::usage(format!("invalid filter {:?}, expected key=value", value))
            })?;
            match key {
                "id" => filter.id.push(val.to_string()),
                "name" => filter.name.push(val.to_string()),
                "status" => filter.status.push(val.to_string()),
                "label" => filter.label.push(match val.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (val.to_string(), None),
                }),
                other => return Err(CtlError::usage(format!("unsupported filter {:?}", other))),
            }
        }
        Ok(filter)
    }

    fn matches(&self, row: &ContainerSummary) -> bool {
        (self.id.is_empty() || self.id.iter().any(|p| row.id.starts_with(p.as_str())))
            && (self.name.is_empty() || self.name.iter().any(|n| row.names.contains(n.as_str())))
            && (self.status.is_empty() || self.status.iter().any(|s| *s == row.state.to_string()))
            && self.label.iter().all(|(k, v)| match (row.labels.get(k), v) {
                (Some(actual), Some(wanted)) => actual == wanted,
                (Some(_), None) => true,
                (None, _) => false,
            })
    }
}

/// `0.0.0.0:8080->80/tcp, ...`
pub fn format_ports(record: &ContainerRecord) -> String {
    let ports: Vec<PortMapping> = record
        .label(labels::PORTS)
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default();
    ports
        .iter()
        .map(|p| {
            let ip = if p.host_ip.is_empty() { "0.0.0.0" } else { p.host_ip.as_str() };
            format!("{}:{}->{}/{}", ip, p.host_port, p.container_port, p.protocol)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn command_line(record: &ContainerRecord) -> String {
    record
        .spec
        .process()
        .as_ref()
        .and_then(|p| p.args().clone())
        .map(|args| args.join(" "))
        .unwrap_or_default()
}

/// Labels the user set, without runectl's own bookkeeping
pub fn user_labels(record: &ContainerRecord) -> BTreeMap<String, String> {
    record
        .labels
        .iter()
        .filter(|(k, _)| !k.starts_with("runectl/") && !k.starts_with("containerd.io/"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl ContainerManager {
    fn summarize(record: &ContainerRecord, state: &ContainerState, now: DateTime<Utc>) -> ContainerSummary {
        ContainerSummary {
            id: record.id.clone(),
            names: Self::name_of(record),
            image: record
                .label(labels::IMAGE_REF)
                .unwrap_or(&record.image)
                .to_string(),
            command: command_line(record),
            created_at: record.created_at,
            status: state.describe(now),
            state: state.status,
            ports: format_ports(record),
            labels: user_labels(record),
        }
    }

    /// `ps`; without `all` only running containers are listed
    pub async fn ps(&self, all: bool, filter: &PsFilter) -> Result<Vec<ContainerSummary>> {
        let now = Utc::now();
        let mut rows = Vec::new();
        for record in self.runtime.list_containers(self.ns()).await? {
            if self.reap_if_orphaned(&record).await? {
                continue;
            }
            let state = match self.state(&record).await {
                Ok(state) => state,
                // Removed by someone else while we were listing.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if !all && !state.is_running() {
                continue;
            }
            let row = Self::summarize(&record, &state, now);
            if filter.matches(&row) {
                rows.push(row);
            }
        }
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        value.to_string()
    } else {
        let cut: String = value.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

/// Docker-style table
pub fn render_table(rows: &[ContainerSummary], no_trunc: bool, now: DateTime<Utc>) -> String {
    let mut table = vec![[
        "CONTAINER ID".to_string(),
        "IMAGE".to_string(),
        "COMMAND".to_string(),
        "CREATED".to_string(),
        "STATUS".to_string(),
        "PORTS".to_string(),
        "NAMES".to_string(),
    ]];
    for row in rows {
        let (id, command) = if no_trunc {
            (row.id.clone(), row.command.clone())
        } else {
            (short_id(&row.id).to_string(), truncate(&row.command, 20))
        };
        table.push([
            id,
            row.image.clone(),
            format!("{:?}", command),
            format!(
                "{} ago",
                super::config::human_duration(now - row.created_at)
            ),
            row.status.clone(),
            row.ports.clone(),
            row.names.clone(),
        ]);
    }
    let mut widths = [0usize; 7];
    for line in &table {
        for (i, cell) in line.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let mut out = String::new();
    for line in &table {
        let cells: Vec<String> = line
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                if i + 1 == line.len() {
                    cell.clone()
                } else {
                    format!("{:width$}", cell, width = widths[i])
                }
            })
            .collect();
        out.push_str(cells.join("    ").trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::super::tests::{capture, manager, options};
    use super::*;
    use crate::runtime::Runtime;

    #[tokio::test]
    async fn test_ps_shows_exit_code() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["sh", "-euxc", "exit 123"]);
        opts.name = Some("c4".into());
        let (local, _out, _err) = capture(None);
        assert!(manager.run(&opts, local).await.is_err());

        let running = manager.ps(false, &PsFilter::default()).await.unwrap();
        assert!(running.is_empty());
        let rows = manager.ps(true, &PsFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].names, "c4");
        assert!(rows[0].status.starts_with("Exited (123)"));

        let table = render_table(&rows, false, Utc::now());
        let mut lines = table.lines();
        assert!(lines.next().unwrap().starts_with("CONTAINER ID"));
        let line = lines.next().unwrap();
        assert!(line.contains("Exited (123)"));
        assert!(line.ends_with("c4"));
    }

    #[tokio::test]
    async fn test_ps_filters() {
        let (manager, _runtime, _temp) = manager();
        for (name, tier) in [("front", "web"), ("back", "db")] {
            let mut opts = options(&["true"]);
            opts.name = Some(name.into());
            opts.labels.insert("tier".into(), tier.into());
            manager.create(&opts).await.unwrap();
        }
        let filter = PsFilter::parse(&["label=tier=db".to_string()]).unwrap();
        let rows = manager.ps(true, &filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].names, "back");
        assert_eq!(rows[0].state, ContainerStatus::Created);
        assert!(!rows[0].labels.contains_key(labels::NAME));

        let filter = PsFilter::parse(&["status=created".to_string(), "name=fro".to_string()]).unwrap();
        assert_eq!(manager.ps(true, &filter).await.unwrap().len(), 1);
        assert!(PsFilter::parse(&["color=red".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_ps_reaps_orphaned_auto_remove() {
        let (manager, runtime, _temp) = manager();
        let mut opts = options(&["true"]);
        opts.rm = true;
        let record = manager.create(&opts).await.unwrap();
        manager
            .tasks()
            .create(&record.id, crate::runtime::TaskIo::Null)
            .await
            .unwrap();
        manager.tasks().start(&record.id, "true").await.unwrap();
        manager
            .tasks()
            .wait(&record.id, &tokio_util::sync::CancellationToken::new())
            .await
            .unwrap();
        assert!(manager.ps(true, &PsFilter::default()).await.unwrap().is_empty());
        assert!(runtime.list_containers("default").await.unwrap().is_empty());
    }
}
