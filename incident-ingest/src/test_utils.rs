//! In-memory stand-ins for the stream and the stores, plus fixture builders.
//!
//! Shared by unit tests and the integration tests under `tests/`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::canonical::compute_key;
use crate::consumer::{Delivery, EnvelopeStream};
use crate::error::{PrimaryStoreError, SecondaryStoreError, StreamError};
use crate::sink::{InsertOutcome, PrimaryStore, SecondaryStore};
use crate::types::Incident;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builds the JSON body of a stream message.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    source: String,
    ingested_at: Option<f64>,
    payload: serde_json::Map<String, Value>,
}

impl EnvelopeBuilder {
    pub fn new(source: &str, source_id: &str) -> Self {
        let mut payload = serde_json::Map::new();
        payload.insert("source_id".into(), json!(source_id));
        payload.insert("title".into(), json!(""));
        payload.insert("body".into(), json!(""));
        payload.insert("occurred_ts".into(), json!(1_700_000_000.0));
        payload.insert("lat".into(), Value::Null);
        payload.insert("lon".into(), Value::Null);
        payload.insert("magnitude".into(), Value::Null);
        Self {
            source: source.to_string(),
            ingested_at: None,
            payload,
        }
    }

    pub fn title(self, title: &str) -> Self {
        self.field("title", json!(title))
    }

    pub fn body(self, body: &str) -> Self {
        self.field("body", json!(body))
    }

    pub fn occurred_ts(self, ts: f64) -> Self {
        self.field("occurred_ts", json!(ts))
    }

    pub fn location(self, lat: f64, lon: f64) -> Self {
        self.field("lat", json!(lat)).field("lon", json!(lon))
    }

    pub fn magnitude(self, magnitude: f64) -> Self {
        self.field("magnitude", json!(magnitude))
    }

    pub fn ingested_at(mut self, ts: f64) -> Self {
        self.ingested_at = Some(ts);
        self
    }

    pub fn field(mut self, name: &str, value: Value) -> Self {
        self.payload.insert(name.to_string(), value);
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        self.payload.remove(name);
        self
    }

    pub fn to_json(&self) -> Value {
        let mut envelope = json!({
            "source": self.source,
            "payload": self.payload,
        });
        if let Some(ts) = self.ingested_at {
            envelope["ingested_at"] = json!(ts);
        }
        envelope
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }
}

/// A persisted-looking incident for sink tests.
pub fn incident(source_id: &str) -> Incident {
    let key = compute_key(
        "usgs_quakes",
        source_id,
        "M4.8 - 10km N of Example",
        Some(37.7),
        Some(-122.4),
        1_700_000_000.0,
    )
    .unwrap_or_else(|e| panic!("fixture key: {e}"));
    Incident {
        canonical_key: key.into_string(),
        source: "usgs_quakes".to_string(),
        source_id: source_id.to_string(),
        title: "M4.8 - 10km N of Example".to_string(),
        body: String::new(),
        occurred_ts: 1_700_000_000.0,
        lat: Some(37.7),
        lon: Some(-122.4),
        magnitude: Some(4.8),
        severity: 0.48,
        geo_bucket: Some("9q8yqxp".to_string()),
        location_text: "10km N of Example".to_string(),
        raw_payload: json!({"source_id": source_id}),
        ingested_at: 1_700_000_000.5,
        processed_at: 1_700_000_001.0,
    }
}

#[derive(Default)]
struct MemoryStreamState {
    pending: VecDeque<Delivery>,
    acked: Vec<Delivery>,
    next_offset: i64,
}

/// Replays queued messages, then reports the stream as closed.
#[derive(Clone, Default)]
pub struct MemoryStream {
    state: Arc<Mutex<MemoryStreamState>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: Vec<u8>) {
        let mut state = lock(&self.state);
        let offset = state.next_offset;
        state.next_offset += 1;
        state.pending.push_back(Delivery {
            payload: Some(payload),
            partition: 0,
            offset,
        });
    }

    pub fn push_envelope(&self, envelope: &EnvelopeBuilder) {
        self.push(envelope.to_bytes());
    }

    pub fn acked(&self) -> Vec<Delivery> {
        lock(&self.state).acked.clone()
    }

    pub fn acked_offsets(&self) -> Vec<i64> {
        lock(&self.state).acked.iter().map(|d| d.offset).collect()
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }
}

#[async_trait]
impl EnvelopeStream for MemoryStream {
    async fn recv(&self) -> Result<Delivery, StreamError> {
        lock(&self.state).pending.pop_front().ok_or(StreamError::Closed)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), StreamError> {
        lock(&self.state).acked.push(delivery.clone());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryPrimaryState {
    rows: HashMap<String, Incident>,
    attempts: u32,
    failures_left: Option<u32>,
    rejecting: bool,
    delay: Option<Duration>,
}

/// Primary store keyed by canonical key. Can be told to fail or stall.
#[derive(Clone, Default)]
pub struct MemoryPrimaryStore {
    state: Arc<Mutex<MemoryPrimaryState>>,
}

impl MemoryPrimaryStore {
    /// Fail the next `count` inserts.
    pub fn fail_next(&self, count: u32) {
        lock(&self.state).failures_left = Some(count);
    }

    pub fn fail_always(&self) {
        lock(&self.state).failures_left = Some(u32::MAX);
    }

    /// Refuse every row the way a database refuses bad data.
    pub fn reject_always(&self) {
        lock(&self.state).rejecting = true;
    }

    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = Some(delay);
    }

    pub fn rows(&self) -> Vec<Incident> {
        lock(&self.state).rows.values().cloned().collect()
    }

    pub fn get(&self, canonical_key: &str) -> Option<Incident> {
        lock(&self.state).rows.get(canonical_key).cloned()
    }

    /// Every insert call, including failed ones.
    pub fn attempts(&self) -> u32 {
        lock(&self.state).attempts
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn insert(&self, incident: &Incident) -> Result<InsertOutcome, PrimaryStoreError> {
        let delay = lock(&self.state).delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        state.attempts += 1;
        if state.rejecting {
            return Err(PrimaryStoreError::Rejected(
                "invalid byte sequence for encoding \"UTF8\": 0x00".to_string(),
            ));
        }
        if let Some(left) = state.failures_left.filter(|left| *left > 0) {
            state.failures_left = Some(left - 1);
            return Err(PrimaryStoreError::Unavailable(
                "connection refused".to_string(),
            ));
        }
        if state.rows.contains_key(&incident.canonical_key) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        state
            .rows
            .insert(incident.canonical_key.clone(), incident.clone());
        Ok(InsertOutcome::Inserted)
    }
}

#[derive(Default)]
struct MemorySecondaryState {
    rows: Vec<Incident>,
    failing: bool,
    delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MemorySecondaryStore {
    state: Arc<Mutex<MemorySecondaryState>>,
}

impl MemorySecondaryStore {
    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }

    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = Some(delay);
    }

    pub fn rows(&self) -> Vec<Incident> {
        lock(&self.state).rows.clone()
    }
}

#[async_trait]
impl SecondaryStore for MemorySecondaryStore {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn insert(&self, incident: &Incident) -> Result<(), SecondaryStoreError> {
        let delay = lock(&self.state).delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.failing {
            return Err(SecondaryStoreError::Rejected("mirror offline".to_string()));
        }
        state.rows.push(incident.clone());
        Ok(())
    }
}
