//! Writes incidents to the system of record and mirrors them for analytics.
//!
//! The primary write is the durability barrier: its errors propagate and the
//! caller must not move past the envelope. The mirror is fire-and-count; its
//! errors never reach the caller and never undo the primary row.

pub mod clickhouse;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{PrimaryStoreError, SecondaryStoreError};
use crate::metrics_consts::SECONDARY_FAILURES;
use crate::types::Incident;

pub use self::clickhouse::{ClickHouseMirror, DisabledMirror};
pub use self::postgres::PgIncidentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same canonical key already exists.
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecondaryOutcome {
    Mirrored,
    Failed(&'static str),
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistResult {
    pub primary: InsertOutcome,
    pub secondary: SecondaryOutcome,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Insert unless a row with the same canonical key exists.
    async fn insert(&self, incident: &Incident) -> Result<InsertOutcome, PrimaryStoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecondaryStore: Send + Sync {
    /// False for a mirror that drops everything.
    fn is_enabled(&self) -> bool;

    async fn insert(&self, incident: &Incident) -> Result<(), SecondaryStoreError>;
}

#[derive(Clone)]
pub struct DualSinkWriter {
    primary: Arc<dyn PrimaryStore>,
    secondary: Arc<dyn SecondaryStore>,
    primary_timeout: Duration,
    secondary_timeout: Duration,
}

impl DualSinkWriter {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        secondary: Arc<dyn SecondaryStore>,
        primary_timeout: Duration,
        secondary_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            primary_timeout,
            secondary_timeout,
        }
    }

    pub async fn persist(&self, incident: &Incident) -> Result<PersistResult, PrimaryStoreError> {
        let primary = tokio::time::timeout(self.primary_timeout, self.primary.insert(incident))
            .await
            .map_err(|_| PrimaryStoreError::Timeout(self.primary_timeout))??;

        let secondary = self.mirror(incident).await;

        Ok(PersistResult { primary, secondary })
    }

    async fn mirror(&self, incident: &Incident) -> SecondaryOutcome {
        if !self.secondary.is_enabled() {
            return SecondaryOutcome::Disabled;
        }

        let result = tokio::time::timeout(self.secondary_timeout, self.secondary.insert(incident))
            .await
            .unwrap_or(Err(SecondaryStoreError::Timeout(self.secondary_timeout)));

        match result {
            Ok(()) => SecondaryOutcome::Mirrored,
            Err(e) => {
                let reason = e.reason();
                warn!(
                    canonical_key = %incident.canonical_key,
                    reason,
                    "failed to mirror incident: {e}"
                );
                metrics::counter!(SECONDARY_FAILURES, "reason" => reason).increment(1);
                SecondaryOutcome::Failed(reason)
            }
        }
    }
}
