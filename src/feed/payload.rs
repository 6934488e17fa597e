//! JSON payload helpers: timestamps and primary keys.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::hlc::Timestamp;

#[derive(Deserialize)]
struct TimestampFields {
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    resolved: Option<String>,
}

/// Extracts the `updated` and `resolved` timestamps from a JSON row or
/// resolved payload. Missing fields come back as the zero timestamp.
pub fn parse_json_value_timestamps(payload: &[u8]) -> Result<(Timestamp, Timestamp)> {
    let fields: TimestampFields = serde_json::from_slice(payload)?;
    let parse = |field: Option<String>| -> Result<Timestamp> {
        match field {
            Some(s) => s.parse(),
            None => Ok(Timestamp::ZERO),
        }
    };
    Ok((parse(fields.updated)?, parse(fields.resolved)?))
}

/// Rebuilds a row's key from its JSON value for sinks that do not carry one.
///
/// Uses the value's top-level `key` array when present (deletes only have
/// that), otherwise `[<after.pk>]`.
pub fn key_from_value(value: &[u8], pk: &str) -> Result<Vec<u8>> {
    let parsed: Value = serde_json::from_slice(value)?;
    if let Some(key) = parsed.get("key").filter(|k| k.is_array()) {
        return Ok(serde_json::to_vec(key)?);
    }
    match parsed.get("after").and_then(|after| after.get(pk)) {
        Some(pk_value) => Ok(format!("[{}]", pk_value).into_bytes()),
        None => Err(Error::Decode(format!(
            "cannot derive key: no `key` and no `after.{}` in {}",
            pk,
            String::from_utf8_lossy(value)
        ))),
    }
}
