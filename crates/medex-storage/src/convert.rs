//! Row <-> domain conversion helpers shared by the repositories.
//!
//! Timestamps are stored as millisecond epochs, uuids as their hyphenated
//! text form, and heterogeneous blobs as JSON text.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn opt_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(to_millis)
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

pub fn opt_from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(DateTime::from_timestamp_millis)
}

pub fn parse_uuid(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| anyhow::anyhow!("invalid uuid {raw:?}: {e}"))
}

pub fn opt_parse_uuid(raw: Option<String>) -> anyhow::Result<Option<Uuid>> {
    raw.as_deref().map(parse_uuid).transpose()
}

pub fn parse_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

/// Placeholder list for a dynamic `IN (...)` clause.
pub fn placeholders(n: usize) -> String {
    std::iter::repeat("?")
        .take(n)
        .collect::<Vec<_>>()
        .join(", ")
}
