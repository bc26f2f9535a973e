//! Terminal session for interactive containers
//!
//! Raw mode is held by a guard so every exit path, including unwinding,
//! restores the terminal.

use crate::error::{CtlError, Result};
use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_DETACH_KEYS: &str = "ctrl-p,ctrl-q";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn current() -> Option<Self> {
        terminal::size().ok().map(|(cols, rows)| Self { cols, rows })
    }
}

/// Puts the local terminal into raw mode until dropped
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self> {
        enable_raw_mode()?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            warn!("failed to restore terminal mode: {}", e);
        }
    }
}

/// Delivers terminal sizes on SIGWINCH
pub struct ResizeWatcher {
    rx: mpsc::UnboundedReceiver<TerminalSize>,
    task: tokio::task::JoinHandle<()>,
}

impl ResizeWatcher {
    pub fn new() -> Result<Self> {
        let mut winch = signal(SignalKind::window_change())?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while winch.recv().await.is_some() {
                if let Some(size) = TerminalSize::current() {
                    debug!("terminal resized to {}x{}", size.cols, size.rows);
                    if tx.send(size).is_err() {
                        break;
                    }
                }
            }
        });
        Ok(Self { rx, task })
    }

    pub async fn recv(&mut self) -> Option<TerminalSize> {
        self.rx.recv().await
    }
}

impl Drop for ResizeWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Parse `--detach-keys`, e.g. `ctrl-p,ctrl-q` or `a,ctrl-c`
pub fn parse_detach_keys(value: &str) -> Result<Vec<u8>> {
    let invalid = || CtlError::usage(format!("invalid detach keys {:?}", value));
    let mut keys = Vec::new();
    for key in value.split(',') {
        let key = key.trim();
        if let Some(ctrl) = key.strip_prefix("ctrl-") {
            let c = match ctrl.as_bytes() {
                [c] => *c,
                _ => return Err(invalid()),
            };
            let code = match c {
                b'a'..=b'z' => c - b'a' + 1,
                b'@' => 0,
                b'[' => 27,
                b'\\' => 28,
                b']' => 29,
                b'^' => 30,
                b'_' => 31,
                _ => return Err(invalid()),
            };
            keys.push(code);
        } else if key.len() == 1 {
            keys.push(key.as_bytes()[0]);
        } else {
            return Err(invalid());
        }
    }
    if keys.is_empty() {
        return Err(invalid());
    }
    Ok(keys)
}

/// Filters stdin for the detach sequence
///
/// Bytes that might start the sequence are held back until the next byte
/// decides; a broken prefix is passed through unchanged.
#[derive(Debug, Clone)]
pub struct DetachScanner {
    keys: Vec<u8>,
    matched: usize,
}

impl DetachScanner {
    pub fn new(keys: Vec<u8>) -> Self {
        Self { keys, matched: 0 }
    }

    /// Returns the bytes to forward, and whether the sequence completed
    pub fn feed(&mut self, input: &[u8]) -> (Vec<u8>, bool) {
        let mut out = Vec::with_capacity(input.len());
        for &b in input {
            if self.keys.is_empty() {
                out.push(b);
                continue;
            }
            if b == self.keys[self.matched] {
                self.matched += 1;
                if self.matched == self.keys.len() {
                    self.matched = 0;
                    return (out, true);
                }
                continue;
            }
            out.extend_from_slice(&self.keys[..self.matched]);
            self.matched = 0;
            if b == self.keys[0] {
                self.matched = 1;
                if self.keys.len() == 1 {
                    self.matched = 0;
                    return (out, true);
                }
            } else {
                out.push(b);
            }
        }
        (out, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_detach_keys() {
        assert_eq!(parse_detach_keys(DEFAULT_DETACH_KEYS).unwrap(), vec![16, 17]);
        assert_eq!(parse_detach_keys("a,ctrl-@").unwrap(), vec![b'a', 0]);
        assert!(parse_detach_keys("ctrl-").is_err());
        assert!(parse_detach_keys("ctrl-1").is_err());
        assert!(parse_detach_keys("abc").is_err());
    }

    #[test]
    fn test_detach_scanner() {
        let mut scanner = DetachScanner::new(vec![16, 17]);
        assert_eq!(scanner.feed(b"ls\n"), (b"ls\n".to_vec(), false));
        // Sequence split across reads.
        assert_eq!(scanner.feed(&[b'x', 16]), (vec![b'x'], false));
        assert_eq!(scanner.feed(&[17]), (vec![], true));
        // A broken prefix is forwarded.
        assert_eq!(scanner.feed(&[16, b'y']), (vec![16, b'y'], false));
        assert_eq!(scanner.feed(&[16, 16, 17]), (vec![16], true));
    }
}
