//! `journald` driver
//!
//! Records go to the journal over its native datagram protocol. Reading
//! them back is left to `journalctl`.

use super::{LogConfig, LogsOptions};
use crate::error::{short_id, CtlError, Result};
use std::path::{Path, PathBuf};
use tokio::net::UnixDatagram;
use tokio::process::Command;
use tracing::debug;

pub const JOURNAL_SOCKET: &str = "/run/systemd/journal/socket";

/// syslog priorities for the two streams
const PRIORITY_INFO: &str = "6";
const PRIORITY_ERR: &str = "3";

/// Serialize fields in the journal's native format
///
/// Values containing a newline use the length-prefixed binary form.
pub fn encode_fields(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in fields {
        out.extend_from_slice(key.as_bytes());
        if value.contains('\n') {
            out.push(b'\n');
            out.extend_from_slice(&(value.len() as u64).to_le_bytes());
            out.extend_from_slice(value.as_bytes());
        } else {
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
        }
        out.push(b'\n');
    }
    out
}

/// Writes one container's output to the journal
pub struct JournalWriter {
    socket: UnixDatagram,
    target: PathBuf,
    fields: Vec<(String, String)>,
}

impl JournalWriter {
    pub fn connect(config: &LogConfig, id: &str) -> Result<Self> {
        Self::with_socket(Path::new(JOURNAL_SOCKET), config, id)
    }

    pub fn with_socket(target: &Path, config: &LogConfig, id: &str) -> Result<Self> {
        let socket = UnixDatagram::unbound()?;
        let identifier = config
            .opts
            .get("tag")
            .cloned()
            .unwrap_or_else(|| short_id(id).to_string());
        let fields = vec![
            ("SYSLOG_IDENTIFIER".to_string(), identifier),
            ("CONTAINER_ID".to_string(), short_id(id).to_string()),
            ("CONTAINER_ID_FULL".to_string(), id.to_string()),
            ("CONTAINER_NAME".to_string(), config.name.clone()),
            ("IMAGE_NAME".to_string(), config.image.clone()),
        ];
        Ok(Self {
            socket,
            target: target.to_path_buf(),
            fields,
        })
    }

    pub async fn write(&self, stream: &str, line: &str) -> Result<()> {
        let message = line.strip_suffix('\n').unwrap_or(line);
        let priority = if stream == "stderr" {
            PRIORITY_ERR
        } else {
            PRIORITY_INFO
        };
        let mut fields: Vec<(&str, &str)> = vec![("MESSAGE", message), ("PRIORITY", priority)];
        fields.extend(self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let datagram = encode_fields(&fields);
        self.socket.send_to(&datagram, &self.target).await?;
        Ok(())
    }
}

/// `journalctl` arguments that reproduce `logs` options for one container
pub fn journalctl_args(id: &str, opts: &LogsOptions) -> Vec<String> {
    let mut args = vec![
        "--no-pager".to_string(),
        "--output".to_string(),
        if opts.timestamps { "short-iso" } else { "cat" }.to_string(),
    ];
    if opts.follow {
        args.push("--follow".to_string());
    }
    if let Some(tail) = opts.tail {
        args.push(format!("--lines={}", tail));
    }
    if let Some(since) = opts.since {
        args.push(format!("--since={}", since.format("%Y-%m-%d %H:%M:%S")));
    }
    if let Some(until) = opts.until {
        args.push(format!("--until={}", until.format("%Y-%m-%d %H:%M:%S")));
    }
    args.push(format!("CONTAINER_ID_FULL={}", id));
    args
}

/// Hand `logs` over to `journalctl`, whose output goes straight to ours
pub async fn read_logs(id: &str, opts: &LogsOptions) -> Result<()> {
    let args = journalctl_args(id, opts);
    debug!("journalctl {}", args.join(" "));
    let status = Command::new("journalctl")
        .args(&args)
        .status()
        .await
        .map_err(|e| CtlError::usage(format!("failed to run journalctl: {}", e)))?;
    if !status.success() {
        return Err(CtlError::usage(format!(
            "journalctl exited with {}",
            status.code().unwrap_or(-1)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_encode_fields() {
        let data = encode_fields(&[("MESSAGE", "hello"), ("PRIORITY", "6")]);
        assert_eq!(data, b"MESSAGE=hello\nPRIORITY=6\n");

        let data = encode_fields(&[("MESSAGE", "a\nb")]);
        let mut expected = b"MESSAGE\n".to_vec();
        expected.extend_from_slice(&3u64.to_le_bytes());
        expected.extend_from_slice(b"a\nb\n");
        assert_eq!(data, expected);
    }

    #[tokio::test]
    async fn test_writer_sends_container_fields() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("journal.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let config = LogConfig {
            name: "web".into(),
            image: "docker.io/library/nginx:latest".into(),
            ..LogConfig::parse(Some("journald"), &[]).unwrap()
        };
        let writer = JournalWriter::with_socket(&path, &config, "0123456789abcdef").unwrap();
        writer.write("stderr", "boom\n").await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = server.recv(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(text.contains("MESSAGE=boom\n"));
        assert!(text.contains("PRIORITY=3\n"));
        assert!(text.contains("SYSLOG_IDENTIFIER=0123456789ab\n"));
        assert!(text.contains("CONTAINER_NAME=web\n"));
        assert!(text.contains("IMAGE_NAME=docker.io/library/nginx:latest\n"));
    }

    #[test]
    fn test_journalctl_args() {
        let opts = LogsOptions {
            follow: true,
            tail: Some(10),
            ..Default::default()
        };
        let args = journalctl_args("abc", &opts);
        assert!(args.contains(&"--follow".to_string()));
        assert!(args.contains(&"--lines=10".to_string()));
        assert_eq!(args.last().unwrap(), "CONTAINER_ID_FULL=abc");
    }
}
