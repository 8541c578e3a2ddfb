//! Duration strings carried on the wire.
//!
//! Long-poll requests encode their wait bound as a human-readable string such
//! as `"500ms"`, `"2s"`, or `"1m30s"`. The accepted units are `ms`, `s`, `m`,
//! and `h`; components must appear in decreasing unit order.

use crate::error::{Error, Result};
use std::time::Duration;

/// Parse a wire duration string into a [`Duration`].
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::InvalidDuration(input.to_string()));
    }

    let bytes = s.as_bytes();
    let mut pos = 0;
    let mut total = Duration::ZERO;
    let mut last_unit_rank = u8::MAX;

    while pos < bytes.len() {
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == start {
            return Err(Error::InvalidDuration(input.to_string()));
        }
        let value: u64 = s[start..pos]
            .parse()
            .map_err(|_| Error::InvalidDuration(input.to_string()))?;

        let unit_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_alphabetic() {
            pos += 1;
        }
        let (rank, unit) = match &s[unit_start..pos] {
            "ms" => (0, Duration::from_millis(value)),
            "s" => (1, Duration::from_secs(value)),
            "m" => (2, Duration::from_secs(value * 60)),
            "h" => (3, Duration::from_secs(value * 3600)),
            _ => return Err(Error::InvalidDuration(input.to_string())),
        };
        if rank >= last_unit_rank {
            return Err(Error::InvalidDuration(input.to_string()));
        }
        last_unit_rank = rank;
        total += unit;
    }

    Ok(total)
}

/// Format a [`Duration`] as a wire duration string.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis() as u64;
    if millis == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    let hours = millis / 3_600_000;
    let minutes = (millis % 3_600_000) / 60_000;
    let secs = (millis % 60_000) / 1000;
    let ms = millis % 1000;
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if secs > 0 {
        out.push_str(&format!("{}s", secs));
    }
    if ms > 0 {
        out.push_str(&format!("{}ms", ms));
    }
    out
}
