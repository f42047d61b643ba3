use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use futures::future::ready;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use incident_ingest::{
    clock::SystemClock,
    config::Config,
    consumer::KafkaEnvelopeStream,
    dedup::NearDuplicateFilter,
    health::HealthRegistry,
    metrics::{serve, setup_metrics_recorder, setup_metrics_routes},
    sink::{ClickHouseMirror, DisabledMirror, DualSinkWriter, PgIncidentStore, SecondaryStore},
    IngestPipeline,
};

const LIVENESS_DEADLINE: Duration = Duration::from_secs(30);

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "incident ingest service"
}

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let recorder = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router, recorder);

    let bind = config.bind_address();
    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("metrics server stopped: {e}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("starting incident ingest service");

    let config = Config::init_with_defaults()
        .context("failed to load configuration from environment variables")?;
    config.validate().context("invalid configuration")?;
    info!(
        topic = %config.kafka_consumer_topic,
        group = %config.kafka_consumer_group,
        threshold = config.dedup_similarity_threshold,
        window_minutes = config.dedup_window_minutes,
        index = ?config.dedup_index,
        "configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");
    let pipeline_liveness = liveness.register("pipeline", LIVENESS_DEADLINE);
    let server_handle = start_server(&config, liveness)?;

    let retry = config.retry_policy();

    let primary = PgIncidentStore::connect(&config, retry)
        .await
        .context("failed to connect to the primary store")?;
    if config.run_migrations {
        primary
            .migrate()
            .await
            .context("failed to migrate the primary store")?;
    }

    let secondary: Arc<dyn SecondaryStore> = match ClickHouseMirror::from_config(&config) {
        Some(mirror) => {
            if let Err(e) = mirror.ensure_table().await {
                warn!("could not ensure clickhouse table exists: {e}");
            }
            Arc::new(mirror)
        }
        None => {
            info!("CLICKHOUSE_URL not set, analytics mirror disabled");
            Arc::new(DisabledMirror)
        }
    };

    let writer = DualSinkWriter::new(
        Arc::new(primary),
        secondary,
        config.primary_timeout(),
        config.secondary_timeout(),
    );

    let stream = KafkaEnvelopeStream::connect(&config, retry)
        .await
        .context("failed to connect to kafka")?;

    let pipeline = IngestPipeline::new(
        stream,
        writer,
        NearDuplicateFilter::new(&config.dedup_config()),
        Arc::new(SystemClock),
        retry,
        config.geo_resolution,
    )
    .with_liveness(pipeline_liveness);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut pipeline_handle = tokio::spawn(pipeline.run(shutdown_rx));

    let result = tokio::select! {
        result = &mut pipeline_handle => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(config.shutdown_timeout(), &mut pipeline_handle).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("pipeline did not stop within {:?}, aborting", config.shutdown_timeout());
                    pipeline_handle.abort();
                    server_handle.abort();
                    return Ok(());
                }
            }
        }
    };

    server_handle.abort();
    result
        .context("pipeline task panicked")?
        .context("pipeline stopped with an error")?;

    info!("incident ingest service stopped");
    Ok(())
}
