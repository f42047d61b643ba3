//! Incident ingestion service.
//!
//! Consumes raw incident envelopes from Kafka, drops near-duplicate reports,
//! enriches the survivors with a severity score and a geohash bucket, writes
//! them idempotently to Postgres and mirrors them to ClickHouse on a best-effort
//! basis.
//!
//! ## Error logging
//!
//! When logging errors that carry a cause chain use `{e:#}` or `error = ?e` so
//! the root cause is visible. Prefer `.context()` over formatting an error into
//! a new string.

pub mod canonical;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod dedup;
pub mod enrich;
pub mod error;
pub mod health;
pub mod metrics;
pub mod metrics_consts;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod test_utils;
pub mod types;

pub use canonical::{compute_key, CanonicalKey};
pub use dedup::{NearDuplicateFilter, Verdict};
pub use pipeline::{IngestPipeline, ProcessOutcome};
pub use sink::{DualSinkWriter, PersistResult};
