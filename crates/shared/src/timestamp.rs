//! Timestamp normalization at ingress
//!
//! Provider payloads and stored documents carry timestamps in several shapes:
//! unix seconds, unix milliseconds, RFC 3339 strings, or document-store
//! timestamp objects (`{"seconds": .., "nanoseconds": ..}`). They are converted
//! here, once, into `OffsetDateTime`; nothing past the boundary sees the union.

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use crate::error::PlatformError;

/// Values above this are treated as milliseconds (year 5138 in seconds)
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Normalize a loosely typed timestamp into `OffsetDateTime`.
///
/// `null` and empty strings yield `Ok(None)`; anything unparseable is an error.
pub fn normalize_timestamp(value: &Value) -> Result<Option<OffsetDateTime>, PlatformError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            let raw = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| PlatformError::InvalidTimestamp(n.to_string()))?;
            from_unix(raw).map(Some)
        }
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            if let Ok(raw) = s.parse::<i64>() {
                return from_unix(raw).map(Some);
            }
            OffsetDateTime::parse(s, &Rfc3339)
                .map(Some)
                .map_err(|e| PlatformError::InvalidTimestamp(format!("{}: {}", s, e)))
        }
        Value::Object(map) => {
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)
                .ok_or_else(|| PlatformError::InvalidTimestamp(value.to_string()))?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let base = OffsetDateTime::from_unix_timestamp(seconds)
                .map_err(|e| PlatformError::InvalidTimestamp(e.to_string()))?;
            Ok(Some(base + Duration::nanoseconds(nanos)))
        }
        other => Err(PlatformError::InvalidTimestamp(other.to_string())),
    }
}

fn from_unix(raw: i64) -> Result<OffsetDateTime, PlatformError> {
    let result = if raw.abs() >= MILLIS_THRESHOLD {
        OffsetDateTime::from_unix_timestamp_nanos(raw as i128 * 1_000_000)
    } else {
        OffsetDateTime::from_unix_timestamp(raw)
    };
    result.map_err(|e| PlatformError::InvalidTimestamp(format!("{}: {}", raw, e)))
}

/// Whole days from `now` until `end`, rounded up, never negative
pub fn days_until_ceil(now: OffsetDateTime, end: OffsetDateTime) -> i64 {
    let diff = end - now;
    if diff <= Duration::ZERO {
        return 0;
    }
    let whole = diff.whole_days();
    if diff > Duration::days(whole) {
        whole + 1
    } else {
        whole
    }
}
