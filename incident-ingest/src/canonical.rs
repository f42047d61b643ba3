//! Idempotency keys for incidents.
//!
//! The key is the uniqueness boundary at the primary store: replays of the same
//! report must hash to the same value, independent of which producer sent it or
//! how it rendered its numbers.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Rendered in place of a missing coordinate. Cannot collide with a number.
const MISSING_COORDINATE: &str = "<none>";
/// Separates fields in the hashed string, so "a|b" + "c" differs from "a" + "b|c".
const FIELD_SEPARATOR: char = '\u{1f}';
/// Anything above this is a millisecond timestamp (year 5138 in seconds).
const MILLIS_THRESHOLD: f64 = 1e11;

/// Hex encoded SHA-256 digest identifying a report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn compute_key(
    source: &str,
    source_id: &str,
    title: &str,
    lat: Option<f64>,
    lon: Option<f64>,
    occurred_ts: f64,
) -> Result<CanonicalKey, ValidationError> {
    if source.is_empty() {
        return Err(ValidationError::MissingField("source"));
    }
    let occurred_ts = normalize_timestamp(occurred_ts)?;
    let lat = render_coordinate(lat, "lat")?;
    let lon = render_coordinate(lon, "lon")?;

    let mut hasher = Sha256::new();
    for (i, field) in [
        source,
        source_id,
        title,
        lat.as_str(),
        lon.as_str(),
        occurred_ts.as_str(),
    ]
    .iter()
    .enumerate()
    {
        if i > 0 {
            let mut buf = [0u8; 4];
            hasher.update(FIELD_SEPARATOR.encode_utf8(&mut buf).as_bytes());
        }
        hasher.update(field.as_bytes());
    }

    Ok(CanonicalKey(hex::encode(hasher.finalize())))
}

/// Seconds since epoch with millisecond precision. Producers that send
/// milliseconds are converted.
fn normalize_timestamp(ts: f64) -> Result<String, ValidationError> {
    if !ts.is_finite() {
        return Err(ValidationError::NonFinite("occurred_ts"));
    }
    let seconds = if ts.abs() > MILLIS_THRESHOLD {
        ts / 1000.0
    } else {
        ts
    };
    let millis = (seconds * 1000.0).round() as i64;
    Ok(format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000)))
}

fn render_coordinate(value: Option<f64>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        None => Ok(MISSING_COORDINATE.to_string()),
        Some(v) if !v.is_finite() => Err(ValidationError::NonFinite(field)),
        // -0.0 and 0.0 are the same place
        Some(v) if v == 0.0 => Ok(format!("{:.7}", 0.0)),
        Some(v) => Ok(format!("{v:.7}")),
    }
}
