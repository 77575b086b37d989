//! Prometheus style durations, e.g. `1h30m`, `5m`, `250ms` or `0`.

use std::time::Duration;

const DAY: u64 = 24 * 60 * 60 * 1000;

/// Units in strictly decreasing order with their length in milliseconds. The
/// flag marks units which are only used for formatting if they divide the
/// duration exactly.
const UNITS: [(&str, u64, bool); 7] = [
    ("y", 365 * DAY, false),
    ("w", 7 * DAY, true),
    ("d", DAY, false),
    ("h", 60 * 60 * 1000, false),
    ("m", 60 * 1000, false),
    ("s", 1000, false),
    ("ms", 1, false),
];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("not a valid duration string: {0:?}")]
pub struct DurationError(pub String);

pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let err = || DurationError(s.to_string());
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(err());
    }
    let mut rest = s;
    let mut total: u64 = 0;
    let mut last: Option<usize> = None;
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(err());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| err())?;
        rest = &rest[digits..];
        let unit_len = rest.bytes().take_while(u8::is_ascii_alphabetic).count();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let idx = UNITS
            .iter()
            .position(|(u, _, _)| *u == unit)
            .ok_or_else(err)?;
        if last.is_some_and(|l| idx <= l) {
            return Err(err());
        }
        last = Some(idx);
        total = value
            .checked_mul(UNITS[idx].1)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(err)?;
    }
    Ok(Duration::from_millis(total))
}

/// Canonical representation as rendered by Prometheus, e.g. `90s` becomes `1m30s`.
pub fn format_duration(d: Duration) -> String {
    let mut ms = d.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, mult, exact) in UNITS {
        if exact && ms % mult != 0 {
            continue;
        }
        let v = ms / mult;
        if v > 0 {
            ms -= v * mult;
            out.push_str(&v.to_string());
            out.push_str(unit);
        }
    }
    out
}
