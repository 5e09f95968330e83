//! Header parsing and error classification shared by the HTTP adapters.

use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::types::RateLimitSnapshot;
use crate::Error;

/// Longest wait a provider header can ask for; larger values are clamped.
pub const MAX_HINT: Duration = Duration::from_secs(24 * 60 * 60);

fn hint_from_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).map_or(MAX_HINT, |d| d.min(MAX_HINT)))
}

/// Read the standard rate-limit headers, request-based variants first.
pub fn rate_limit_snapshot(headers: &HeaderMap) -> RateLimitSnapshot {
    let header = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
    };

    RateLimitSnapshot {
        remaining: header(&["x-ratelimit-remaining-requests", "x-ratelimit-remaining"])
            .and_then(|v| v.trim().parse().ok()),
        reset_after: header(&["x-ratelimit-reset-requests", "x-ratelimit-reset"])
            .and_then(parse_reset),
    }
}

/// `Retry-After` in seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(hint_from_secs)
}

/// Parse reset values such as `"20"`, `"1.5"`, `"6m0s"`, `"1h2m3s"` or `"250ms"`.
pub fn parse_reset(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return hint_from_secs(secs);
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .filter(|i| *i > 0)?;
        let (number, tail) = rest.split_at(split);
        let number: f64 = number.parse().ok()?;
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let unit_secs = match unit {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total = total.saturating_add(hint_from_secs(number * unit_secs)?);
        rest = tail;
    }
    Some(total.min(MAX_HINT))
}

/// Transport failures (timeouts, refused or reset connections) are transient.
pub fn classify_transport(provider: &str, error: reqwest::Error) -> Error {
    if error.is_builder() {
        Error::config(format!("{provider}: {error}"))
    } else {
        Error::transient(provider, error.to_string())
    }
}
