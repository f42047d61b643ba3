use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// The transport wrapper published by the collectors.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RawEnvelope {
    pub source: String,
    #[serde(default)]
    pub ingested_at: Option<f64>,
    pub payload: RawPayload,
}

/// Report fields the pipeline understands. Anything else the collector sent is
/// kept in `extra` and persisted untouched as part of the raw payload.
///
/// Collectors are loose about optional fields: a `null` title or body reads as
/// empty, and a magnitude that is not a number reads as absent.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct RawPayload {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub source_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub body: String,
    #[serde(default)]
    pub occurred_ts: Option<f64>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default, deserialize_with = "number_or_none")]
    pub magnitude: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// The payload exactly as received, set by [`RawEnvelope::from_slice`].
    #[serde(skip)]
    pub received: Option<Value>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn number_or_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        _ => None,
    })
}

fn contains_nul(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains('\0'),
        Value::Array(items) => items.iter().any(contains_nul),
        Value::Object(map) => map.iter().any(|(k, v)| k.contains('\0') || contains_nul(v)),
        _ => false,
    }
}

impl RawEnvelope {
    /// Decodes a message body. Fails on anything that is not an envelope; field
    /// level checks happen in [`RawEnvelope::validate`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ValidationError> {
        if bytes.is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let received = value.get("payload").cloned();
        let mut envelope: RawEnvelope =
            serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        envelope.payload.received = received;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source.trim().is_empty() {
            return Err(ValidationError::MissingField("source"));
        }
        if self.payload.source_id.trim().is_empty() {
            return Err(ValidationError::MissingField("payload.source_id"));
        }
        match self.payload.occurred_ts {
            None => return Err(ValidationError::MissingField("payload.occurred_ts")),
            Some(ts) if !ts.is_finite() => {
                return Err(ValidationError::NonFinite("payload.occurred_ts"))
            }
            Some(_) => {}
        }
        if matches!(self.ingested_at, Some(ts) if !ts.is_finite()) {
            return Err(ValidationError::NonFinite("ingested_at"));
        }
        // postgres text and jsonb cannot hold NUL
        if self.source.contains('\0') {
            return Err(ValidationError::NulByte("source"));
        }
        if contains_nul(&self.payload.raw_json()) {
            return Err(ValidationError::NulByte("payload"));
        }
        Ok(())
    }
}

impl RawPayload {
    pub fn raw_json(&self) -> Value {
        match &self.received {
            Some(received) => received.clone(),
            None => serde_json::to_value(self).unwrap_or(Value::Null),
        }
    }
}

/// A persisted report. Written once, never updated.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Incident {
    pub canonical_key: String,
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub body: String,
    pub occurred_ts: f64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub magnitude: Option<f64>,
    pub severity: f64,
    pub geo_bucket: Option<String>,
    pub location_text: String,
    pub raw_payload: Value,
    pub ingested_at: f64,
    pub processed_at: f64,
}

impl Incident {
    /// End-to-end latency in seconds, never negative.
    pub fn latency_seconds(&self) -> f64 {
        (self.processed_at - self.ingested_at).max(0.0)
    }
}

pub fn epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}
