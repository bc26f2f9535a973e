//! `stats`: CPU, memory and pids sampled from task metrics

use super::ContainerManager;
use crate::error::{short_id, CtlError, Result};
use crate::runtime::{ContainerRecord, TaskMetrics};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Time between two samples
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// One row of `stats`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatsEntry {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "CPUPerc")]
    pub cpu_percent: f64,
    pub mem_usage: u64,
    pub mem_limit: u64,
    #[serde(rename = "MemPerc")]
    pub mem_percent: f64,
    #[serde(rename = "PIDs")]
    pub pids: u64,
}

/// CPU share of one core between two samples `elapsed` apart
pub fn cpu_percent(before: &TaskMetrics, after: &TaskMetrics, elapsed: Duration) -> f64 {
    let wall = elapsed.as_nanos() as f64;
    if wall <= 0.0 {
        return 0.0;
    }
    let used = after.cpu_usage_ns.saturating_sub(before.cpu_usage_ns) as f64;
    used / wall * 100.0
}

fn host_memory() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|info| {
            info.lines()
                .find_map(|l| l.strip_prefix("MemTotal:"))
                .and_then(|v| v.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        })
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

/// `1.5MiB`, `512B`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.2}{}", value, UNITS[unit])
    }
}

pub fn render_stats(rows: &[StatsEntry]) -> String {
    let mut out = format!(
        "{:<14}{:<20}{:<9}{:<24}{:<9}{}\n",
        "CONTAINER ID", "NAME", "CPU %", "MEM USAGE / LIMIT", "MEM %", "PIDS"
    );
    for row in rows {
        out.push_str(&format!(
            "{:<14}{:<20}{:<9}{:<24}{:<9}{}\n",
            short_id(&row.id),
            row.name,
            format!("{:.2}%", row.cpu_percent),
            format!("{} / {}", format_bytes(row.mem_usage), format_bytes(row.mem_limit)),
            format!("{:.2}%", row.mem_percent),
            row.pids
        ));
    }
    out
}

impl ContainerManager {
    async fn stats_targets(&self, queries: &[String]) -> Result<Vec<ContainerRecord>> {
        if queries.is_empty() {
            let mut running = Vec::new();
            for record in self.runtime.list_containers(self.ns()).await? {
                if self.state(&record).await?.is_running() {
                    running.push(record);
                }
            }
            return Ok(running);
        }
        let mut records = Vec::new();
        for query in queries {
            let record = self.resolve(query).await?;
            if !self.state(&record).await?.is_running() {
                return Err(CtlError::NotRunning {
                    id: Self::name_of(&record),
                });
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn sample(&self, records: &[ContainerRecord]) -> Vec<Option<(TaskMetrics, Instant)>> {
        let mut samples = Vec::with_capacity(records.len());
        for record in records {
            match self.runtime.task_metrics(self.ns(), &record.id).await {
                Ok(metrics) => samples.push(Some((metrics, Instant::now()))),
                Err(e) => {
                    debug!("no metrics for {}: {}", record.id, e);
                    samples.push(None);
                }
            }
        }
        samples
    }

    /// `stats`; one table with `no_stream`, otherwise one per interval
    /// until the command is cancelled
    pub async fn stats<F>(&self, queries: &[String], no_stream: bool, emit: F) -> Result<()>
    where
        F: FnMut(&[StatsEntry]) -> Result<()>,
    {
        self.stats_every(queries, no_stream, STATS_INTERVAL, emit).await
    }

    pub(crate) async fn stats_every<F>(
        &self,
        queries: &[String],
        no_stream: bool,
        interval: Duration,
        mut emit: F,
    ) -> Result<()>
    where
        F: FnMut(&[StatsEntry]) -> Result<()>,
    {
        let records = self.stats_targets(queries).await?;
        let cancel = self.cancel_token();
        let host_total = host_memory();
        let mut previous = self.sample(&records).await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
            let current = self.sample(&records).await;
            let mut rows = Vec::new();
            for ((record, before), after) in records.iter().zip(&previous).zip(&current) {
                let (Some((before, t0)), Some((after, t1))) = (before, after) else {
                    continue;
                };
                let limit = if after.memory_limit > 0 {
                    after.memory_limit
                } else {
                    host_total
                };
                rows.push(StatsEntry {
                    id: record.id.clone(),
                    name: Self::name_of(record),
                    cpu_percent: cpu_percent(before, after, t1.duration_since(*t0)),
                    mem_usage: after.memory_usage,
                    mem_limit: limit,
                    mem_percent: if limit > 0 {
                        after.memory_usage as f64 / limit as f64 * 100.0
                    } else {
                        0.0
                    },
                    pids: after.pids,
                });
            }
            emit(&rows)?;
            if no_stream {
                return Ok(());
            }
            previous = current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{capture, manager, options};
    use super::*;

    #[test]
    fn test_cpu_percent() {
        let before = TaskMetrics {
            cpu_usage_ns: 1_000_000_000,
            ..Default::default()
        };
        let after = TaskMetrics {
            cpu_usage_ns: 1_500_000_000,
            ..Default::default()
        };
        let pct = cpu_percent(&before, &after, Duration::from_secs(1));
        assert!((pct - 50.0).abs() < 1e-9);
        assert_eq!(cpu_percent(&after, &after, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(4 * 1024 * 1024), "4.00MiB");
        assert_eq!(format_bytes(1536), "1.50KiB");
    }

    #[tokio::test]
    async fn test_stats_no_stream() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["sleep", "1h"]);
        opts.name = Some("busy".into());
        opts.detach = true;
        opts.resources.memory = Some("64m".into());
        let (local, _out, _err) = capture(None);
        manager.run(&opts, local).await.unwrap();

        let mut tables = Vec::new();
        manager
            .stats_every(&[], true, Duration::from_millis(50), |rows| {
                tables.push(rows.to_vec());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(tables.len(), 1);
        let row = &tables[0][0];
        assert_eq!(row.name, "busy");
        assert_eq!(row.pids, 1);
        assert_eq!(row.mem_limit, 64 * 1024 * 1024);
        assert!(row.mem_percent > 0.0);
        assert!(render_stats(&tables[0]).contains("busy"));
    }

    #[tokio::test]
    async fn test_stats_stream_stops_on_cancel() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["sleep", "1h"]);
        opts.detach = true;
        let (local, _out, _err) = capture(None);
        manager.run(&opts, local).await.unwrap();

        let cancel = manager.cancel_token();
        let mut count = 0;
        manager
            .stats_every(&[], false, Duration::from_millis(20), |_| {
                count += 1;
                if count == 3 {
                    cancel.cancel();
                }
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(count, 3);
    }
}
