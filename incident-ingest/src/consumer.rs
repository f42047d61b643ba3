//! Source of raw envelopes.
//!
//! Offsets are only stored when the pipeline acknowledges a delivery, and the
//! client's auto-commit flushes stored offsets in the background. A delivery
//! that is never acknowledged is redelivered after a restart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message,
};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::StreamError;
use crate::retry::RetryPolicy;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// One message read from the stream, with the position needed to ack it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// `None` for tombstones.
    pub payload: Option<Vec<u8>>,
    pub partition: i32,
    pub offset: i64,
}

impl Delivery {
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

#[async_trait]
pub trait EnvelopeStream: Send + Sync {
    /// Waits for the next delivery.
    async fn recv(&self) -> Result<Delivery, StreamError>;

    /// Marks a delivery as fully handled. Deliveries on a partition must be
    /// acknowledged in the order they were received.
    fn ack(&self, delivery: &Delivery) -> Result<(), StreamError>;
}

#[derive(Clone)]
pub struct KafkaEnvelopeStream {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaEnvelopeStream {
    pub fn new(config: &Config) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false");

        client_config.set("enable.auto.offset.store", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka_consumer_topic.as_str()])?;

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: config.kafka_consumer_topic.clone(),
            }),
        })
    }

    /// Builds the consumer and waits until the broker answers a metadata
    /// request for the topic, backing off between attempts.
    pub async fn connect(config: &Config, policy: RetryPolicy) -> Result<Self, StreamError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::new(config) {
                Ok(stream) => match stream.check_connection().await {
                    Ok(()) => {
                        info!(
                            topic = %config.kafka_consumer_topic,
                            group = %config.kafka_consumer_group,
                            "connected to kafka"
                        );
                        return Ok(stream);
                    }
                    Err(e) if policy.should_retry(attempt) => {
                        warn!(attempt, "kafka not reachable yet: {e}");
                    }
                    Err(e) => return Err(e),
                },
                Err(e) if policy.should_retry(attempt) => {
                    warn!(attempt, "failed to create kafka consumer: {e}");
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(policy.retry_interval(attempt)).await;
        }
    }

    async fn check_connection(&self) -> Result<(), StreamError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            inner
                .consumer
                .fetch_metadata(Some(inner.topic.as_str()), METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await
        .map_err(|e| StreamError::Unavailable(e.to_string()))?
        .map_err(StreamError::from)
    }
}

#[async_trait]
impl EnvelopeStream for KafkaEnvelopeStream {
    async fn recv(&self) -> Result<Delivery, StreamError> {
        let message = self.inner.consumer.recv().await?;
        Ok(Delivery {
            payload: message.payload().map(<[u8]>::to_vec),
            partition: message.partition(),
            offset: message.offset(),
        })
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), StreamError> {
        self.inner
            .consumer
            .store_offset(&self.inner.topic, delivery.partition, delivery.offset)?;
        Ok(())
    }
}
