use std::time::Duration;

use thiserror::Error;

/// A single envelope could not be turned into an incident. These are never
/// retried: the envelope is counted, logged and acknowledged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("received empty message payload")]
    EmptyMessage,
    #[error("envelope is not valid json: {0}")]
    Malformed(String),
    #[error("required field {0} is missing or empty")]
    MissingField(&'static str),
    #[error("field {0} is not a finite number")]
    NonFinite(&'static str),
    #[error("field {0} contains a NUL character")]
    NulByte(&'static str),
    #[error("primary store refused the incident: {0}")]
    Unstorable(String),
}

impl ValidationError {
    /// Short, bounded-cardinality label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::EmptyMessage => "empty",
            ValidationError::Malformed(_) => "malformed",
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::NonFinite(_) => "non_finite",
            ValidationError::NulByte(_) => "nul_byte",
            ValidationError::Unstorable(_) => "unstorable",
        }
    }
}

/// Failures talking to the system of record. Everything except `Rejected` is
/// treated as transient: the envelope is not acknowledged until the write
/// succeeds.
#[derive(Error, Debug)]
pub enum PrimaryStoreError {
    #[error("primary store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("primary store migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("primary store write timed out after {0:?}")]
    Timeout(Duration),
    #[error("primary store unavailable: {0}")]
    Unavailable(String),
    /// The row itself is unacceptable. Writing it again fails the same way.
    #[error("primary store rejected row: {0}")]
    Rejected(String),
}

impl PrimaryStoreError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, PrimaryStoreError::Rejected(_))
    }
}

/// Failures writing to the analytics mirror. Recorded, never propagated.
#[derive(Error, Debug)]
pub enum SecondaryStoreError {
    #[error("clickhouse insert failed: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),
    #[error("secondary store write timed out after {0:?}")]
    Timeout(Duration),
    #[error("secondary store rejected row: {0}")]
    Rejected(String),
}

impl SecondaryStoreError {
    pub fn reason(&self) -> &'static str {
        match self {
            SecondaryStoreError::ClickHouse(_) => "clickhouse",
            SecondaryStoreError::Timeout(_) => "timeout",
            SecondaryStoreError::Rejected(_) => "rejected",
        }
    }
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("stream closed")]
    Closed,
    #[error("stream unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value}")]
    OutOfRange {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl ConfigError {
    pub fn out_of_range(name: &'static str, expected: &'static str, value: impl ToString) -> Self {
        ConfigError::OutOfRange {
            name,
            expected,
            value: value.to_string(),
        }
    }
}

/// Errors that stop the pipeline. The process is expected to exit and be
/// restarted, replaying from the last acknowledged position.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("primary store write failed after {attempts} attempts: {source}")]
    PrimaryExhausted {
        attempts: u32,
        #[source]
        source: PrimaryStoreError,
    },
    #[error("failed to receive from stream: {0}")]
    Stream(#[from] StreamError),
    #[error("failed to acknowledge offset: {0}")]
    Ack(StreamError),
    #[error("shutdown requested while retrying, envelope left unacknowledged")]
    Interrupted,
}
