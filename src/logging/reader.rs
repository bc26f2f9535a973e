//! Reading json-file logs back for `logs`

use super::json_file::{self, LogEntry};
use crate::error::{CtlError, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, SecondsFormat, TimeZone, Utc};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FOLLOW_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct LogsOptions {
    pub follow: bool,
    /// Number of lines from the end; `None` shows everything
    pub tail: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub timestamps: bool,
}

impl LogsOptions {
    fn in_window(&self, entry: &LogEntry) -> bool {
        self.since.map(|s| entry.time >= s).unwrap_or(true)
            && self.until.map(|u| entry.time <= u).unwrap_or(true)
    }
}

/// Parse `--since` / `--until`
///
/// Accepts RFC 3339, a plain date, unix seconds (with optional fraction) or
/// a relative duration such as `10m` or `1h30m`, counted back from `now`.
pub fn parse_timestamp(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let value = value.trim();
    let invalid = || CtlError::usage(format!("invalid timestamp {:?}", value));
    if value.is_empty() {
        return Err(invalid());
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    if let Ok(secs) = value.parse::<f64>() {
        let whole = secs.trunc() as i64;
        let nanos = ((secs - secs.trunc()) * 1e9) as u32;
        return Utc.timestamp_opt(whole, nanos).single().ok_or_else(invalid);
    }
    let duration = parse_duration(value).ok_or_else(invalid)?;
    Ok(now - duration)
}

pub(crate) fn parse_duration(value: &str) -> Option<ChronoDuration> {
    let mut total = ChronoDuration::zero();
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        let n: i64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        total = total
            + match unit {
                "ms" => ChronoDuration::milliseconds(n),
                "s" => ChronoDuration::seconds(n),
                "m" => ChronoDuration::minutes(n),
                "h" => ChronoDuration::hours(n),
                _ => return None,
            };
    }
    Some(total)
}

/// Apply the time window, then `--tail`
pub fn select(entries: Vec<LogEntry>, opts: &LogsOptions) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = entries.into_iter().filter(|e| opts.in_window(e)).collect();
    if let Some(tail) = opts.tail {
        let skip = entries.len().saturating_sub(tail);
        entries.drain(..skip);
    }
    entries
}

/// Text printed for one entry
pub fn render(entry: &LogEntry, timestamps: bool) -> String {
    if timestamps {
        format!(
            "{} {}",
            entry.time.to_rfc3339_opts(SecondsFormat::Nanos, true),
            entry.log
        )
    } else {
        entry.log.clone()
    }
}

fn rotated_first(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.1", path.display()))
}

fn read_from(path: &Path, offset: u64) -> Result<(Vec<u8>, u64)> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    if len <= offset {
        return Ok((Vec::new(), len));
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok((data, len))
}

/// Complete lines from `data`, plus how many bytes they cover
fn complete_lines(data: &[u8]) -> (Vec<LogEntry>, u64) {
    let Some(end) = data.iter().rposition(|b| *b == b'\n') else {
        return (Vec::new(), 0);
    };
    let entries = data[..end]
        .split(|b| *b == b'\n')
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_slice(l).ok())
        .collect();
    (entries, end as u64 + 1)
}

/// New entries appended since `offset`, following one rotation
fn poll(path: &Path, offset: &mut u64) -> Result<Vec<LogEntry>> {
    let current_len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let mut entries = Vec::new();
    if current_len < *offset {
        // Rotated: what we have not seen yet ended up in `.1`.
        let (data, _) = read_from(&rotated_first(path), *offset)?;
        entries.extend(complete_lines(&data).0);
        *offset = 0;
    }
    let (data, _) = read_from(path, *offset)?;
    let (fresh, consumed) = complete_lines(&data);
    *offset += consumed;
    entries.extend(fresh);
    Ok(entries)
}

/// Print a container's json-file log through `emit`
///
/// With `follow`, keeps polling the active file until `stop` is cancelled,
/// then drains whatever is left.
pub async fn read_json_file(
    path: &Path,
    opts: &LogsOptions,
    stop: &CancellationToken,
    mut emit: impl FnMut(&LogEntry) -> Result<()>,
) -> Result<()> {
    let mut offset = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    for entry in select(json_file::read_all(path)?, opts) {
        emit(&entry)?;
    }
    if !opts.follow {
        return Ok(());
    }

    loop {
        let stopping = tokio::select! {
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => false,
            _ = stop.cancelled() => true,
        };
        for entry in poll(path, &mut offset)? {
            if opts.until.map(|u| entry.time > u).unwrap_or(false) {
                return Ok(());
            }
            if opts.in_window(&entry) {
                emit(&entry)?;
            }
        }
        if stopping {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::JsonFileWriter;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[test]
    fn test_parse_timestamp() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(
            parse_timestamp("2024-05-01T10:00:00Z", now).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            parse_timestamp("2024-04-30", now).unwrap(),
            Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap()
        );
        assert_eq!(parse_timestamp("1714564800", now).unwrap(), now);
        assert_eq!(
            parse_timestamp("1h30m", now).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap()
        );
        assert!(parse_timestamp("yesterday", now).is_err());
        assert!(parse_timestamp("10x", now).is_err());
    }

    fn entry(log: &str, secs: i64) -> LogEntry {
        LogEntry {
            log: log.to_string(),
            stream: "stdout".to_string(),
            time: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_select_window_then_tail() {
        let entries = vec![entry("a\n", 10), entry("b\n", 20), entry("c\n", 30), entry("d\n", 40)];
        let opts = LogsOptions {
            since: Some(Utc.timestamp_opt(15, 0).unwrap()),
            tail: Some(2),
            ..Default::default()
        };
        let logs: Vec<String> = select(entries.clone(), &opts).into_iter().map(|e| e.log).collect();
        assert_eq!(logs, vec!["c\n", "d\n"]);

        let opts = LogsOptions {
            until: Some(Utc.timestamp_opt(20, 0).unwrap()),
            ..Default::default()
        };
        assert_eq!(select(entries, &opts).len(), 2);
        assert_eq!(
            render(&entry("x\n", 0), true),
            "1970-01-01T00:00:00.000000000Z x\n"
        );
    }

    #[tokio::test]
    async fn test_follow_picks_up_new_lines() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("c-json.log");
        let mut writer = JsonFileWriter::open(&path, 0, 1, false).unwrap();
        writer.write(&LogEntry::new("stdout", "one\n")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();
        let task = {
            let seen = seen.clone();
            let stop = stop.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let opts = LogsOptions {
                    follow: true,
                    ..Default::default()
                };
                read_json_file(&path, &opts, &stop, |e| {
                    seen.lock().unwrap().push(e.log.clone());
                    Ok(())
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.write(&LogEntry::new("stdout", "two\n")).unwrap();
        writer.write(&LogEntry::new("stderr", "three\n")).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        stop.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["one\n", "two\n", "three\n"]);
    }

    #[test]
    fn test_poll_follows_rotation() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("r-json.log");
        let mut writer = JsonFileWriter::open(&path, 250, 2, false).unwrap();
        let long = format!("{}\n", "x".repeat(200));
        writer.write(&LogEntry::new("stdout", long)).unwrap();
        let mut offset = std::fs::metadata(&path).unwrap().len();

        writer.write(&LogEntry::new("stdout", "second\n")).unwrap();
        writer.write(&LogEntry::new("stdout", "third\n")).unwrap();
        let logs: Vec<String> = poll(&path, &mut offset)
            .unwrap()
            .into_iter()
            .map(|e| e.log)
            .collect();
        assert_eq!(logs, vec!["second\n", "third\n"]);
    }
}
