//! `top`: the container's processes through the host `ps`

use super::ContainerManager;
use crate::error::{CtlError, Result};
use tokio::process::Command;
use tracing::debug;

/// Header and rows of a `ps` listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessList {
    pub titles: Vec<String>,
    pub processes: Vec<Vec<String>>,
}

impl ProcessList {
    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.titles.iter().map(|t| t.len()).collect();
        for row in &self.processes {
            for (i, cell) in row.iter().enumerate() {
                if i < widths.len() {
                    widths[i] = widths[i].max(cell.len());
                }
            }
        }
        let line = |cells: &[String]| {
            let mut out = cells
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{:width$}", c, width = widths.get(i).copied().unwrap_or(0)))
                .collect::<Vec<_>>()
                .join("    ");
            out.truncate(out.trim_end().len());
            out.push('\n');
            out
        };
        let mut out = line(&self.titles);
        for row in &self.processes {
            out.push_str(&line(row));
        }
        out
    }
}

/// Keep the rows of `ps` output whose PID column is one of `pids`
pub fn filter_ps_output(output: &str, pids: &[u32]) -> Result<ProcessList> {
    let mut lines = output.lines();
    let header = lines
        .next()
        .ok_or_else(|| CtlError::internal("ps printed nothing"))?;
    let titles: Vec<String> = header.split_whitespace().map(str::to_string).collect();
    let pid_column = titles
        .iter()
        .position(|t| t == "PID")
        .ok_or_else(|| CtlError::usage("ps output has no PID column"))?;
    let columns = titles.len();
    let mut processes = Vec::new();
    for line in lines {
        let mut fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if fields.len() <= pid_column {
            continue;
        }
        let Ok(pid) = fields[pid_column].parse::<u32>() else {
            continue;
        };
        if !pids.contains(&pid) {
            continue;
        }
        // The last column (the command) may contain spaces.
        if fields.len() > columns {
            let tail = fields.split_off(columns - 1).join(" ");
            fields.push(tail);
        }
        processes.push(fields);
    }
    Ok(ProcessList { titles, processes })
}

impl ContainerManager {
    /// `top CONTAINER [ps options]`; `-ef` when no options are given
    pub async fn top(&self, query: &str, ps_args: &[String]) -> Result<ProcessList> {
        let record = self.resolve(query).await?;
        if !self.state(&record).await?.is_running() {
            return Err(CtlError::NotRunning {
                id: Self::name_of(&record),
            });
        }
        let pids = self.runtime.task_pids(self.ns(), &record.id).await?;
        let args: Vec<String> = if ps_args.is_empty() {
            vec!["-ef".to_string()]
        } else {
            ps_args.to_vec()
        };
        debug!("ps {:?} for pids {:?}", args, pids);
        let output = Command::new("ps").args(&args).output().await?;
        if !output.status.success() {
            return Err(CtlError::usage(format!(
                "ps {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        filter_ps_output(&String::from_utf8_lossy(&output.stdout), &pids)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{manager, options};
    use super::*;

    const PS: &str = "\
UID          PID    PPID  C STIME TTY          TIME CMD
root           1       0  0 10:00 ?        00:00:01 /sbin/init
root        1000       1  0 10:01 ?        00:00:00 sleep 1h
root        1001    1000  0 10:01 ?        00:00:00 sh -c echo hi
";

    #[test]
    fn test_filter_keeps_container_pids() {
        let list = filter_ps_output(PS, &[1000, 1001]).unwrap();
        assert_eq!(list.titles[1], "PID");
        assert_eq!(list.processes.len(), 2);
        assert_eq!(list.processes[0][7], "sleep 1h");
        assert_eq!(list.processes[1][7], "sh -c echo hi");
        let rendered = list.render();
        assert!(rendered.starts_with("UID"));
        assert!(rendered.contains("sleep 1h"));
        assert!(!rendered.contains("/sbin/init"));
    }

    #[test]
    fn test_filter_needs_pid_column() {
        assert!(filter_ps_output("USER CMD\nroot init\n", &[1]).is_err());
    }

    #[tokio::test]
    async fn test_top_needs_running_container() {
        let (manager, _runtime, _temp) = manager();
        let mut opts = options(&["true"]);
        opts.name = Some("still".into());
        manager.create(&opts).await.unwrap();
        assert!(matches!(
            manager.top("still", &[]).await.unwrap_err(),
            CtlError::NotRunning { .. }
        ));
    }
}
