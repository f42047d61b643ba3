use async_trait::async_trait;
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::config::Config;
use crate::error::SecondaryStoreError;
use crate::types::Incident;

use super::SecondaryStore;

/// Analytics projection of an incident.
#[derive(Row, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRow {
    pub id: u64,
    pub source: String,
    pub title: String,
    pub magnitude: Option<f64>,
    pub severity: f64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub occurred_ts: OffsetDateTime,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl TryFrom<&Incident> for IncidentRow {
    type Error = SecondaryStoreError;

    fn try_from(incident: &Incident) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row_id(&incident.canonical_key)?,
            source: incident.source.clone(),
            title: incident.title.clone(),
            magnitude: incident.magnitude,
            severity: incident.severity,
            occurred_ts: to_datetime(incident.occurred_ts)?,
            lat: incident.lat,
            lon: incident.lon,
        })
    }
}

/// The leading 64 bits of the canonical key. Replays map to the same id, so a
/// ReplacingMergeTree collapses them.
fn row_id(canonical_key: &str) -> Result<u64, SecondaryStoreError> {
    canonical_key
        .get(..16)
        .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
        .ok_or_else(|| SecondaryStoreError::Rejected(format!("bad canonical key {canonical_key}")))
}

fn to_datetime(seconds: f64) -> Result<OffsetDateTime, SecondaryStoreError> {
    let millis = (seconds * 1000.0).round();
    if !millis.is_finite() {
        return Err(SecondaryStoreError::Rejected(format!("bad timestamp {seconds}")));
    }
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .map_err(|e| SecondaryStoreError::Rejected(e.to_string()))
}

#[derive(Clone)]
pub struct ClickHouseMirror {
    client: Client,
    table: String,
}

impl ClickHouseMirror {
    /// `None` when no url is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let url = config.clickhouse_url.as_ref()?;
        let client = Client::default()
            .with_url(url.clone())
            .with_database(config.clickhouse_database.clone())
            .with_user(config.clickhouse_user.clone())
            .with_password(config.clickhouse_password.clone());

        info!("mirroring incidents to clickhouse at {url}");
        Some(Self {
            client,
            table: config.clickhouse_table.clone(),
        })
    }

    pub async fn ensure_table(&self) -> Result<(), SecondaryStoreError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id UInt64,
                source String,
                title String,
                magnitude Nullable(Float64),
                severity Float64,
                occurred_ts DateTime64(3, 'UTC'),
                lat Nullable(Float64),
                lon Nullable(Float64)
            ) ENGINE = ReplacingMergeTree ORDER BY id",
            self.table
        );
        self.client.query(&ddl).execute().await?;
        Ok(())
    }
}

#[async_trait]
impl SecondaryStore for ClickHouseMirror {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn insert(&self, incident: &Incident) -> Result<(), SecondaryStoreError> {
        let row = IncidentRow::try_from(incident)?;
        let mut insert = self.client.insert(&self.table)?;
        insert.write(&row).await?;
        insert.end().await?;
        Ok(())
    }
}

/// Stands in for the mirror when analytics are not configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledMirror;

#[async_trait]
impl SecondaryStore for DisabledMirror {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn insert(&self, _incident: &Incident) -> Result<(), SecondaryStoreError> {
        Ok(())
    }
}
