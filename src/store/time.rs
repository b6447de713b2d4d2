//! Canonical instant handling at the storage boundary.
//!
//! Stored documents and remote payloads carry timestamps in several shapes:
//! RFC3339 strings, `{seconds, nanoseconds}` pairs (with or without a leading
//! underscore), and integer epoch milliseconds. Everything is normalized here
//! to `DateTime<Utc>`; internal logic never touches the raw representations.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Parse any supported timestamp representation into a canonical instant.
pub fn parse_instant(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            // Bare numbers are epoch milliseconds.
            let ms = n.as_i64()?;
            Utc.timestamp_millis_opt(ms).single()
        }
        Value::Object(map) => {
            let secs = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Utc.timestamp_opt(secs, nanos as u32).single()
        }
        _ => None,
    }
}

/// Serialize a canonical instant for storage (RFC3339, second precision kept).
pub fn instant_to_value(dt: DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339())
}
