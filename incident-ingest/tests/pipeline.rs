use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::oneshot;

use incident_ingest::{
    clock::ManualClock,
    consumer::EnvelopeStream,
    dedup::{DedupConfig, IndexKind},
    error::PipelineError,
    retry::RetryPolicy,
    sink::{InsertOutcome, SecondaryOutcome},
    test_utils::{EnvelopeBuilder, MemoryPrimaryStore, MemorySecondaryStore, MemoryStream},
    DualSinkWriter, IngestPipeline, NearDuplicateFilter, PersistResult, ProcessOutcome,
};

struct TestPipeline {
    stream: MemoryStream,
    primary: MemoryPrimaryStore,
    secondary: MemorySecondaryStore,
    clock: ManualClock,
    pipeline: IngestPipeline<MemoryStream>,
}

impl TestPipeline {
    fn new(threshold: f64, window: chrono::Duration) -> Self {
        Self::with_index(threshold, window, IndexKind::Exact)
    }

    fn with_index(threshold: f64, window: chrono::Duration, index: IndexKind) -> Self {
        let stream = MemoryStream::new();
        let primary = MemoryPrimaryStore::default();
        let secondary = MemorySecondaryStore::default();
        let clock = ManualClock::new(start());
        let writer = DualSinkWriter::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let filter = NearDuplicateFilter::new(&DedupConfig {
            threshold,
            window,
            num_perm: 64,
            index,
        });
        let pipeline = IngestPipeline::new(
            stream.clone(),
            writer,
            filter,
            Arc::new(clock.clone()),
            RetryPolicy::new(2, Duration::from_millis(10), None, 3),
            7,
        );
        Self {
            stream,
            primary,
            secondary,
            clock,
            pipeline,
        }
    }

    fn with_defaults() -> Self {
        Self::new(0.8, chrono::Duration::minutes(45))
    }

    /// Push one envelope and take it through the pipeline.
    async fn ingest(&mut self, envelope: &EnvelopeBuilder) -> ProcessOutcome {
        self.ingest_bytes(envelope.to_bytes()).await
    }

    async fn ingest_bytes(&mut self, bytes: Vec<u8>) -> ProcessOutcome {
        self.stream.push(bytes);
        let delivery = self.stream.recv().await.unwrap();
        let (_tx, mut shutdown) = oneshot::channel();
        self.pipeline
            .process(&delivery, &mut shutdown)
            .await
            .unwrap()
    }
}

fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_010, 0).unwrap()
}

fn quake(source_id: &str) -> EnvelopeBuilder {
    EnvelopeBuilder::new("usgs_quakes", source_id)
        .title("M4.8 - 10km N of Example")
        .occurred_ts(1_700_000_000.0)
        .location(37.7, -122.4)
        .magnitude(4.8)
        .ingested_at(1_700_000_005.0)
        .field("place", json!("10km N of Example"))
}

#[tokio::test]
async fn earthquake_is_enriched_and_persisted() {
    let mut t = TestPipeline::with_defaults();

    let outcome = t.ingest(&quake("eq1")).await;
    let ProcessOutcome::Persisted {
        canonical_key,
        result,
    } = outcome
    else {
        panic!("expected the report to be persisted");
    };
    assert_eq!(
        result,
        PersistResult {
            primary: InsertOutcome::Inserted,
            secondary: SecondaryOutcome::Mirrored,
        }
    );

    let rows = t.primary.rows();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.canonical_key, canonical_key);
    assert_eq!(row.canonical_key.len(), 64);
    assert_eq!(row.source, "usgs_quakes");
    assert_eq!(row.source_id, "eq1");
    assert!((row.severity - 0.48).abs() < 1e-9);
    assert_eq!(row.geo_bucket.as_deref(), Some("9q8yqxp"));
    assert_eq!(row.location_text, "10km N of Example");
    assert_eq!(row.raw_payload["place"], json!("10km N of Example"));
    assert_eq!(row.latency_seconds(), 5.0);

    assert_eq!(t.secondary.rows().len(), 1);
    assert_eq!(t.stream.acked_offsets(), vec![0]);
}

#[tokio::test]
async fn near_duplicate_inside_window_is_dropped() {
    let mut t = TestPipeline::new(0.5, chrono::Duration::seconds(60));

    let first = t.ingest(&quake("eq1")).await;
    let ProcessOutcome::Persisted { canonical_key, .. } = first else {
        panic!("expected the first report to be persisted");
    };

    t.clock.advance(chrono::Duration::seconds(5));
    let second = t.ingest(&quake("eq1b").occurred_ts(1_700_000_004.0)).await;
    match second {
        ProcessOutcome::Duplicate {
            matched_key,
            canonical_key: duplicate_key,
            similarity,
        } => {
            assert_eq!(matched_key, canonical_key);
            assert_ne!(duplicate_key, canonical_key);
            assert!(similarity >= 0.5);
        }
        other => panic!("expected a duplicate, got {other:?}"),
    }

    assert_eq!(t.primary.rows().len(), 1);
    assert_eq!(t.secondary.rows().len(), 1);
    // duplicates are acknowledged too
    assert_eq!(t.stream.acked_offsets(), vec![0, 1]);
}

#[tokio::test]
async fn reworded_report_is_dropped_by_the_lsh_index() {
    let mut t = TestPipeline::with_index(0.5, chrono::Duration::seconds(60), IndexKind::Lsh);

    let first = t.ingest(&quake("eq1")).await;
    let ProcessOutcome::Persisted { canonical_key, .. } = first else {
        panic!("expected the first report to be persisted");
    };

    t.clock.advance(chrono::Duration::seconds(5));
    let reworded = quake("eq1b")
        .title("M4.8 quake - 10km N of Example")
        .occurred_ts(1_700_000_004.0);
    match t.ingest(&reworded).await {
        ProcessOutcome::Duplicate {
            matched_key,
            similarity,
            ..
        } => {
            assert_eq!(matched_key, canonical_key);
            assert!(
                (0.5..1.0).contains(&similarity),
                "similarity {similarity}"
            );
        }
        other => panic!("expected a duplicate, got {other:?}"),
    }

    assert_eq!(t.primary.rows().len(), 1);
    assert_eq!(t.stream.acked_offsets(), vec![0, 1]);
}

#[tokio::test]
async fn similar_report_after_window_is_admitted() {
    let mut t = TestPipeline::new(0.5, chrono::Duration::seconds(60));

    t.ingest(&quake("eq1")).await;
    t.clock.advance(chrono::Duration::seconds(61));
    let second = t.ingest(&quake("eq1b")).await;

    assert!(matches!(second, ProcessOutcome::Persisted { .. }));
    assert_eq!(t.primary.rows().len(), 2);
}

#[tokio::test]
async fn missing_coordinates_persist_without_bucket() {
    let mut t = TestPipeline::with_defaults();

    let envelope = EnvelopeBuilder::new("gdelt", "g1")
        .title("Protest reported downtown")
        .body("Crowds gathered outside city hall");
    let outcome = t.ingest(&envelope).await;
    assert!(matches!(outcome, ProcessOutcome::Persisted { .. }));

    let rows = t.primary.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].geo_bucket, None);
    assert_eq!(rows[0].lat, None);
    assert_eq!(rows[0].severity, 0.3);
    assert_eq!(rows[0].location_text, "");
}

#[tokio::test]
async fn non_numeric_magnitude_uses_default_severity() {
    let mut t = TestPipeline::with_defaults();

    let cases = [
        (quake("eq1"), json!("unknown")),
        (
            quake("eq2").title("M4.8 - 20km S of Elsewhere"),
            json!("4.8"),
        ),
    ];
    for (envelope, magnitude) in cases {
        let envelope = envelope.field("magnitude", magnitude.clone());
        let ProcessOutcome::Persisted { canonical_key, .. } = t.ingest(&envelope).await else {
            panic!("expected a magnitude of {magnitude} to be tolerated");
        };
        let row = t.primary.get(&canonical_key).unwrap();
        assert_eq!(row.severity, 0.3);
        assert_eq!(row.magnitude, None);
        assert_eq!(row.raw_payload["magnitude"], magnitude);
    }
    assert_eq!(t.stream.acked_offsets(), vec![0, 1]);
}

#[tokio::test]
async fn null_title_and_body_read_as_empty() {
    let mut t = TestPipeline::with_defaults();

    let untitled = EnvelopeBuilder::new("gdelt", "g1")
        .field("title", json!(null))
        .body("Flood near Mumbai");
    let ProcessOutcome::Persisted { canonical_key, .. } = t.ingest(&untitled).await else {
        panic!("expected the untitled report to be persisted");
    };
    let row = t.primary.get(&canonical_key).unwrap();
    assert_eq!(row.title, "");
    assert_eq!(row.body, "Flood near Mumbai");

    let empty = EnvelopeBuilder::new("gdelt", "g2")
        .title("Bridge collapse on river crossing")
        .field("body", json!(null));
    assert!(matches!(
        t.ingest(&empty).await,
        ProcessOutcome::Persisted { .. }
    ));
    assert_eq!(t.primary.rows().len(), 2);
}

#[tokio::test]
async fn nul_character_is_dropped_and_the_stream_moves_on() {
    let t = TestPipeline::with_defaults();
    t.stream.push_envelope(
        &EnvelopeBuilder::new("gdelt", "g1")
            .title("Flood\u{0}near Mumbai")
            .body("Water rising"),
    );
    t.stream.push_envelope(&quake("eq1"));

    let (_tx, shutdown) = oneshot::channel();
    t.pipeline.run(shutdown).await.unwrap();

    let rows = t.primary.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source_id, "eq1");
    assert_eq!(t.stream.acked_offsets(), vec![0, 1]);
    assert_eq!(t.stream.pending(), 0);
}

#[tokio::test]
async fn invalid_envelopes_are_acknowledged_and_dropped() {
    let mut t = TestPipeline::with_defaults();

    let cases = vec![
        (Vec::new(), "empty"),
        (b"{not json".to_vec(), "malformed"),
        (
            EnvelopeBuilder::new("usgs_quakes", "").title("x").to_bytes(),
            "missing_field",
        ),
        (
            EnvelopeBuilder::new("usgs_quakes", "eq9")
                .without("occurred_ts")
                .to_bytes(),
            "missing_field",
        ),
        (
            json!({"payload": {"source_id": "a", "occurred_ts": 1.0}})
                .to_string()
                .into_bytes(),
            "malformed",
        ),
    ];
    let count = cases.len() as i64;

    for (bytes, reason) in cases {
        let outcome = t.ingest_bytes(bytes).await;
        assert_eq!(outcome, ProcessOutcome::Invalid { reason });
    }

    assert!(t.primary.rows().is_empty());
    assert_eq!(t.stream.acked_offsets(), (0..count).collect::<Vec<_>>());
}

#[tokio::test]
async fn secondary_failure_does_not_block_acknowledgment() {
    let mut t = TestPipeline::with_defaults();
    t.secondary.set_failing(true);

    let outcome = t.ingest(&quake("eq1")).await;
    let ProcessOutcome::Persisted { result, .. } = outcome else {
        panic!("expected the report to be persisted");
    };
    assert_eq!(result.primary, InsertOutcome::Inserted);
    assert_eq!(result.secondary, SecondaryOutcome::Failed("rejected"));

    assert_eq!(t.primary.rows().len(), 1);
    assert!(t.secondary.rows().is_empty());
    assert_eq!(t.stream.acked_offsets(), vec![0]);
}

#[tokio::test]
async fn replay_after_restart_is_idempotent() {
    let mut t = TestPipeline::with_defaults();
    t.ingest(&quake("eq1")).await;

    // a restarted process shares the store but starts with an empty filter
    let mut restarted = TestPipeline::with_defaults();
    restarted.primary = t.primary.clone();
    let writer = DualSinkWriter::new(
        Arc::new(t.primary.clone()),
        Arc::new(restarted.secondary.clone()),
        Duration::from_secs(1),
        Duration::from_secs(1),
    );
    restarted.pipeline = IngestPipeline::new(
        restarted.stream.clone(),
        writer,
        NearDuplicateFilter::new(&DedupConfig::default()),
        Arc::new(restarted.clock.clone()),
        RetryPolicy::default(),
        7,
    );

    let outcome = restarted.ingest(&quake("eq1")).await;
    let ProcessOutcome::Persisted { result, .. } = outcome else {
        panic!("expected the replay to reach the store");
    };
    assert_eq!(result.primary, InsertOutcome::AlreadyPresent);
    assert_eq!(t.primary.rows().len(), 1);
    assert_eq!(restarted.stream.acked_offsets(), vec![0]);
}

#[tokio::test]
async fn run_drains_the_stream() {
    let t = TestPipeline::with_defaults();
    t.stream.push_envelope(&quake("eq1"));
    t.stream.push_envelope(&quake("eq1"));
    t.stream.push(b"garbage".to_vec());
    t.stream.push_envelope(
        &EnvelopeBuilder::new("gdelt", "g1").title("Bridge collapse on river crossing"),
    );

    let (_tx, shutdown) = oneshot::channel();
    t.pipeline.run(shutdown).await.unwrap();

    assert_eq!(t.stream.pending(), 0);
    assert_eq!(t.stream.acked_offsets(), vec![0, 1, 2, 3]);
    assert_eq!(t.primary.rows().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_primary_halts_without_acknowledging() {
    let t = TestPipeline::with_defaults();
    t.primary.fail_always();
    t.stream.push_envelope(&quake("eq1"));
    t.stream.push_envelope(&quake("eq2"));

    let (_tx, shutdown) = oneshot::channel();
    let err = t.pipeline.run(shutdown).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::PrimaryExhausted { attempts: 3, .. }
    ));
    assert_eq!(t.primary.attempts(), 3);
    assert!(t.stream.acked().is_empty());
    // the next envelope is never touched
    assert_eq!(t.stream.pending(), 1);
}

#[tokio::test]
async fn shutdown_stops_an_idle_pipeline() {
    let t = TestPipeline::with_defaults();
    let (tx, shutdown) = oneshot::channel();
    tx.send(()).unwrap();

    t.pipeline.run(shutdown).await.unwrap();
    assert!(t.stream.acked().is_empty());
}
