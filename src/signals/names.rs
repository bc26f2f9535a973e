//! Signal names as users type them

use crate::error::{CtlError, Result};
use nix::sys::signal::Signal;
use std::str::FromStr;

/// Parse `SIGTERM`, `TERM`, `term` or `15`
pub fn parse_signal(value: &str) -> Result<i32> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i32>() {
        return Signal::try_from(n)
            .map(|s| s as i32)
            .map_err(|_| CtlError::usage(format!("invalid signal: {}", value)));
    }
    let upper = value.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&name)
        .map(|s| s as i32)
        .map_err(|_| CtlError::usage(format!("invalid signal: {}", value)))
}

/// `SIGTERM` for 15; the number itself when unknown
pub fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| signal.to_string())
}
