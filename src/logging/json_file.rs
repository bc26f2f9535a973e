//! `json-file` driver: newline-delimited `{log, stream, time}` records
//!
//! Rotation keeps `<id>-json.log` as the active file, `.1` as the most
//! recent rotated file (left uncompressed) and `.2.gz` onwards gzip
//! compressed, never more than `max-file` files in total.

use super::LogConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log: String,
    pub stream: String,
    pub time: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(stream: &str, log: impl Into<String>) -> Self {
        Self {
            log: log.into(),
            stream: stream.to_string(),
            time: Utc::now(),
        }
    }
}

/// Rotating writer for one container
pub struct JsonFileWriter {
    path: PathBuf,
    max_size: u64,
    max_file: u32,
    compress: bool,
    file: BufWriter<File>,
    size: u64,
}

fn rotated(path: &Path, index: u32, compressed: bool) -> PathBuf {
    let suffix = if compressed { ".gz" } else { "" };
    PathBuf::from(format!("{}.{}{}", path.display(), index, suffix))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn gzip_file(from: &Path, to: &Path) -> Result<()> {
    let mut data = Vec::new();
    File::open(from)?.read_to_end(&mut data)?;
    let mut encoder = GzEncoder::new(File::create(to)?, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?;
    fs::remove_file(from)?;
    Ok(())
}

impl JsonFileWriter {
    pub fn open(path: impl Into<PathBuf>, max_size: u64, max_file: u32, compress: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            max_size,
            max_file: max_file.max(1),
            compress,
            file: BufWriter::new(file),
            size,
        })
    }

    pub fn from_config(path: impl Into<PathBuf>, config: &LogConfig) -> Result<Self> {
        Self::open(path, config.max_size()?, config.max_file()?, config.compress())
    }

    pub fn write(&mut self, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let len = line.len() as u64;
        if self.max_size > 0 && self.size > 0 && self.size + len > self.max_size {
            self.rotate()?;
        }
        self.file.write_all(&line)?;
        self.file.flush()?;
        self.size += len;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        debug!("rotating {}", self.path.display());
        self.file.flush()?;

        if self.max_file > 1 {
            let oldest = self.max_file - 1;
            remove_if_exists(&rotated(&self.path, oldest, oldest > 1 && self.compress))?;
            for i in (2..oldest).rev() {
                let from = rotated(&self.path, i, self.compress);
                if from.exists() {
                    fs::rename(&from, rotated(&self.path, i + 1, self.compress))?;
                }
            }
            let first = rotated(&self.path, 1, false);
            if oldest > 1 && first.exists() {
                let second = rotated(&self.path, 2, self.compress);
                if self.compress {
                    if let Err(e) = gzip_file(&first, &second) {
                        warn!("failed to compress {}: {}", first.display(), e);
                        fs::rename(&first, rotated(&self.path, 2, false))?;
                    }
                } else {
                    fs::rename(&first, &second)?;
                }
            }
            fs::rename(&self.path, &first)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.file = BufWriter::new(file);
        self.size = 0;
        Ok(())
    }
}

/// Existing log segments, oldest first, ending with the active file
pub fn segments(path: &Path) -> Vec<PathBuf> {
    let mut rotated_files: Vec<(u32, PathBuf)> = Vec::new();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(dir) = path.parent() {
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let Some(rest) = file_name.strip_prefix(&format!("{}.", name)) else {
                    continue;
                };
                let index = rest.strip_suffix(".gz").unwrap_or(rest);
                if let Ok(index) = index.parse::<u32>() {
                    rotated_files.push((index, entry.path()));
                }
            }
        }
    }
    rotated_files.sort_by(|a, b| b.0.cmp(&a.0));
    let mut out: Vec<PathBuf> = rotated_files.into_iter().map(|(_, p)| p).collect();
    if path.exists() {
        out.push(path.to_path_buf());
    }
    out
}

/// Parse one segment, transparently decompressing `.gz` files
pub fn read_segment(path: &Path) -> Result<Vec<LogEntry>> {
    let file = File::open(path)?;
    let reader: Box<dyn BufRead> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => debug!("skipping malformed log line in {}: {}", path.display(), e),
        }
    }
    Ok(entries)
}

/// Every entry across all segments, oldest first
pub fn read_all(path: &Path) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    for segment in segments(path) {
        entries.extend(read_segment(&segment)?);
    }
    Ok(entries)
}
