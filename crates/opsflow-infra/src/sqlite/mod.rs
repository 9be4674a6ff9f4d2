//! SQLite persistence: split reader/writer pools and one repository
//! implementation per entity family. Rows use TEXT ids, RFC 3339 TEXT
//! timestamps, and JSON TEXT blobs for document-shaped columns.

pub mod approval;
pub mod event;
pub mod execution;
pub mod kv;
pub mod pool;
pub mod workflow;

use chrono::{DateTime, Utc};
use opsflow_types::error::RepositoryError;
use uuid::Uuid;

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse a status-like enum from its wire string via serde.
pub(crate) fn parse_enum<T: serde::de::DeserializeOwned>(
    raw: &str,
    what: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {raw}")))
}

/// Render a status-like enum to its wire string via serde.
pub(crate) fn enum_str<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    what: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

pub(crate) fn to_json<T: serde::Serialize>(
    value: &T,
    what: &str,
) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}
