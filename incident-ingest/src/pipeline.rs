//! The per-envelope state machine.
//!
//! Received -> KeyComputed -> DedupEvaluated -> (Enriched -> Persisted) -> Acknowledged
//!
//! An envelope is only acknowledged once it was rejected as a duplicate, found
//! invalid, or written to the primary store. A primary failure that outlives
//! the retry budget stops the pipeline with the envelope unacknowledged, so a
//! restart replays it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::canonical::compute_key;
use crate::clock::Clock;
use crate::consumer::{Delivery, EnvelopeStream};
use crate::dedup::{NearDuplicateFilter, Verdict};
use crate::enrich::{derive_geo_bucket, derive_location_text, derive_severity};
use crate::error::{PipelineError, StreamError, ValidationError};
use crate::health::HealthHandle;
use crate::metrics_consts::{
    DUPLICATES_DROPPED, INCIDENTS_ALREADY_PRESENT, INCIDENTS_INSERTED, INVALID_MESSAGES,
    LATENCY_HISTOGRAM, MESSAGES_CONSUMED, PRIMARY_RETRIES,
};
use crate::retry::RetryPolicy;
use crate::sink::{DualSinkWriter, InsertOutcome, PersistResult};
use crate::types::{epoch_seconds, Incident, RawEnvelope};

/// How long the loop waits on an idle stream before reporting liveness again.
const IDLE_HEARTBEAT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Persisted {
        canonical_key: String,
        result: PersistResult,
    },
    Duplicate {
        canonical_key: String,
        matched_key: String,
        similarity: f64,
    },
    Invalid {
        reason: &'static str,
    },
}

pub struct IngestPipeline<S> {
    stream: S,
    writer: DualSinkWriter,
    filter: NearDuplicateFilter,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    geo_resolution: usize,
    liveness: Option<HealthHandle>,
}

impl<S: EnvelopeStream> IngestPipeline<S> {
    pub fn new(
        stream: S,
        writer: DualSinkWriter,
        filter: NearDuplicateFilter,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        geo_resolution: usize,
    ) -> Self {
        Self {
            stream,
            writer,
            filter,
            clock,
            retry,
            geo_resolution,
            liveness: None,
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn filter(&self) -> &NearDuplicateFilter {
        &self.filter
    }

    /// Consume until shutdown is signalled or the stream closes. Returns an
    /// error when the pipeline cannot make progress.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), PipelineError> {
        let mut stream_failures = 0;
        loop {
            self.report_healthy();

            let received = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping pipeline");
                    return Ok(());
                }
                received = tokio::time::timeout(IDLE_HEARTBEAT, self.stream.recv()) => received,
            };

            let delivery = match received {
                Err(_elapsed) => continue,
                Ok(Ok(delivery)) => {
                    stream_failures = 0;
                    delivery
                }
                Ok(Err(StreamError::Closed)) => {
                    info!("stream closed, stopping pipeline");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    stream_failures += 1;
                    if !self.retry.should_retry(stream_failures) {
                        error!(attempts = stream_failures, "giving up on stream: {e}");
                        self.report_unhealthy("stream unavailable");
                        return Err(e.into());
                    }
                    warn!(attempt = stream_failures, "failed to receive from stream: {e}");
                    tokio::time::sleep(self.retry.retry_interval(stream_failures)).await;
                    continue;
                }
            };

            match self.process(&delivery, &mut shutdown).await {
                Ok(_) => {}
                Err(PipelineError::Interrupted) => {
                    info!(
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "shutdown during retry, envelope left for redelivery"
                    );
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "pipeline halted: {e:#}"
                    );
                    self.report_unhealthy("pipeline halted");
                    return Err(e);
                }
            }
        }
    }

    /// Take one delivery through the whole state machine, acknowledgment
    /// included. `shutdown` is only watched while backing off between
    /// primary retries.
    pub async fn process(
        &mut self,
        delivery: &Delivery,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Result<ProcessOutcome, PipelineError> {
        let outcome = match RawEnvelope::from_slice(delivery.payload()) {
            Err(e) => {
                metrics::counter!(MESSAGES_CONSUMED, "source" => "unknown").increment(1);
                self.reject_invalid(delivery, "unknown", e)
            }
            Ok(envelope) => {
                metrics::counter!(MESSAGES_CONSUMED, "source" => envelope.source.clone())
                    .increment(1);
                match envelope.validate() {
                    Err(e) => self.reject_invalid(delivery, &envelope.source, e),
                    Ok(()) => self.process_envelope(delivery, envelope, shutdown).await?,
                }
            }
        };

        self.stream.ack(delivery).map_err(PipelineError::Ack)?;
        Ok(outcome)
    }

    async fn process_envelope(
        &mut self,
        delivery: &Delivery,
        envelope: RawEnvelope,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Result<ProcessOutcome, PipelineError> {
        let payload = &envelope.payload;
        // validate() guarantees a finite timestamp
        let occurred_ts = payload.occurred_ts.unwrap_or_default();

        let canonical_key = match compute_key(
            &envelope.source,
            &payload.source_id,
            &payload.title,
            payload.lat,
            payload.lon,
            occurred_ts,
        ) {
            Ok(key) => key.into_string(),
            Err(e) => return Ok(self.reject_invalid(delivery, &envelope.source, e)),
        };

        let received_at = self.clock.now();
        let verdict = self
            .filter
            .evaluate(&canonical_key, &payload.title, &payload.body, received_at);
        if let Verdict::Rejected {
            matched_key,
            similarity,
        } = verdict
        {
            metrics::counter!(DUPLICATES_DROPPED, "source" => envelope.source.clone())
                .increment(1);
            debug!(
                source = %envelope.source,
                source_id = %payload.source_id,
                %canonical_key,
                %matched_key,
                similarity,
                "dropped near-duplicate"
            );
            return Ok(ProcessOutcome::Duplicate {
                canonical_key,
                matched_key,
                similarity,
            });
        }

        let mut incident = Incident {
            canonical_key,
            source: envelope.source.clone(),
            source_id: payload.source_id.clone(),
            title: payload.title.clone(),
            body: payload.body.clone(),
            occurred_ts,
            lat: payload.lat,
            lon: payload.lon,
            magnitude: payload.magnitude,
            severity: derive_severity(payload),
            geo_bucket: derive_geo_bucket(payload.lat, payload.lon, self.geo_resolution),
            location_text: derive_location_text(payload),
            raw_payload: payload.raw_json(),
            ingested_at: envelope
                .ingested_at
                .unwrap_or_else(|| epoch_seconds(received_at)),
            processed_at: epoch_seconds(received_at),
        };

        let result = match self.persist_with_retry(&mut incident, shutdown).await? {
            Ok(result) => result,
            Err(refused) => return Ok(self.reject_invalid(delivery, &incident.source, refused)),
        };

        match result.primary {
            InsertOutcome::Inserted => {
                metrics::counter!(INCIDENTS_INSERTED, "source" => incident.source.clone())
                    .increment(1)
            }
            InsertOutcome::AlreadyPresent => {
                metrics::counter!(INCIDENTS_ALREADY_PRESENT, "source" => incident.source.clone())
                    .increment(1)
            }
        }
        metrics::histogram!(LATENCY_HISTOGRAM).record(incident.latency_seconds());
        debug!(
            source = %incident.source,
            source_id = %incident.source_id,
            canonical_key = %incident.canonical_key,
            primary = ?result.primary,
            secondary = ?result.secondary,
            "persisted incident"
        );

        Ok(ProcessOutcome::Persisted {
            canonical_key: incident.canonical_key,
            result,
        })
    }

    /// The inner error is a row the primary store will never accept; it is
    /// dropped like any other invalid envelope.
    async fn persist_with_retry(
        &self,
        incident: &mut Incident,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Result<Result<PersistResult, ValidationError>, PipelineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            incident.processed_at = epoch_seconds(self.clock.now());
            match self.writer.persist(incident).await {
                Ok(result) => return Ok(Ok(result)),
                Err(e) if e.is_permanent() => {
                    return Ok(Err(ValidationError::Unstorable(e.to_string())))
                }
                Err(e) if self.retry.should_retry(attempt) => {
                    let wait = self.retry.retry_interval(attempt);
                    warn!(
                        attempt,
                        canonical_key = %incident.canonical_key,
                        ?wait,
                        "primary store write failed, retrying: {e}"
                    );
                    metrics::counter!(PRIMARY_RETRIES).increment(1);
                    self.report_healthy();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = &mut *shutdown => return Err(PipelineError::Interrupted),
                    }
                }
                Err(source) => {
                    return Err(PipelineError::PrimaryExhausted {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    fn reject_invalid(
        &self,
        delivery: &Delivery,
        source: &str,
        error: ValidationError,
    ) -> ProcessOutcome {
        warn!(
            partition = delivery.partition,
            offset = delivery.offset,
            source,
            "dropping invalid envelope: {error}"
        );
        metrics::counter!(INVALID_MESSAGES, "reason" => error.reason()).increment(1);
        ProcessOutcome::Invalid {
            reason: error.reason(),
        }
    }

    fn report_healthy(&self) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }

    fn report_unhealthy(&self, reason: &str) {
        if let Some(liveness) = &self.liveness {
            liveness.report_unhealthy(reason);
        }
    }
}
