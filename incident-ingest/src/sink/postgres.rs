use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::PrimaryStoreError;
use crate::retry::RetryPolicy;
use crate::types::Incident;

use super::{InsertOutcome, PrimaryStore};

/// The system of record. `incident_hash` is unique, so replays of the same
/// report are no-ops.
#[derive(Clone)]
pub struct PgIncidentStore {
    pool: PgPool,
}

impl PgIncidentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens the pool, backing off while the database is unreachable.
    pub async fn connect(config: &Config, policy: RetryPolicy) -> Result<Self, PrimaryStoreError> {
        let options = PgPoolOptions::new()
            .max_connections(config.max_pg_connections)
            .acquire_timeout(config.primary_timeout());

        let mut attempt = 0;
        loop {
            attempt += 1;
            match options.clone().connect(&config.database_url).await {
                Ok(pool) => {
                    info!("connected to primary store");
                    return Ok(Self::new(pool));
                }
                Err(e) if policy.should_retry(attempt) => {
                    warn!(attempt, "primary store not reachable yet: {e}");
                    tokio::time::sleep(policy.retry_interval(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn migrate(&self) -> Result<(), PrimaryStoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Separates errors caused by the row from errors caused by the database being
/// unhealthy. Data exceptions (class 22) and integrity violations (class 23)
/// repeat on every retry.
fn classify(error: sqlx::Error) -> PrimaryStoreError {
    let rejected = match &error {
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_data_error(&code)),
        sqlx::Error::Encode(_) => true,
        _ => false,
    };
    if rejected {
        PrimaryStoreError::Rejected(error.to_string())
    } else {
        PrimaryStoreError::Database(error)
    }
}

fn is_data_error(sqlstate: &str) -> bool {
    sqlstate.starts_with("22") || sqlstate.starts_with("23")
}

#[async_trait]
impl PrimaryStore for PgIncidentStore {
    async fn insert(&self, incident: &Incident) -> Result<InsertOutcome, PrimaryStoreError> {
        let result = sqlx::query(
            r#"
INSERT INTO incidents (
    incident_hash, source, source_id, title, body, occurred_ts, lat, lon,
    magnitude, severity, geo_bucket, location_text, raw_payload, ingested_at, processed_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
ON CONFLICT (incident_hash) DO NOTHING
            "#,
        )
        .bind(&incident.canonical_key)
        .bind(&incident.source)
        .bind(&incident.source_id)
        .bind(&incident.title)
        .bind(&incident.body)
        .bind(incident.occurred_ts)
        .bind(incident.lat)
        .bind(incident.lon)
        .bind(incident.magnitude)
        .bind(incident.severity)
        .bind(&incident.geo_bucket)
        .bind(&incident.location_text)
        .bind(&incident.raw_payload)
        .bind(incident.ingested_at)
        .bind(incident.processed_at)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        match result.rows_affected() {
            0 => Ok(InsertOutcome::AlreadyPresent),
            _ => Ok(InsertOutcome::Inserted),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("22021", true ; "invalid byte sequence")]
    #[test_case("22003", true ; "numeric out of range")]
    #[test_case("23502", true ; "not null violation")]
    #[test_case("08006", false ; "connection failure")]
    #[test_case("40001", false ; "serialization failure")]
    #[test_case("57P01", false ; "admin shutdown")]
    fn data_errors_are_not_retried(sqlstate: &str, expected: bool) {
        assert_eq!(is_data_error(sqlstate), expected);
    }

    #[test]
    fn connection_errors_stay_transient() {
        let error = classify(sqlx::Error::PoolTimedOut);
        assert!(matches!(error, PrimaryStoreError::Database(_)));
        assert!(!error.is_permanent());
    }
}
