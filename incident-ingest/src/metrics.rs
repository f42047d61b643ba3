use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::Response,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::metrics_consts::{HTTP_REQUESTS, HTTP_REQUEST_DURATION, LATENCY_HISTOGRAM};

const METRICS_PATH: &str = "/metrics";
// label for requests no route matched
const UNMATCHED_PATH: &str = "unmatched";

/// Serves the health and metrics router until the listener fails.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %listener.local_addr()?, "serving health and metrics");

    axum::serve(listener, router).await
}

/// Add the prometheus endpoint and middleware to a router, should be called last.
pub fn setup_metrics_routes(router: Router, recorder_handle: PrometheusHandle) -> Router {
    router
        .route(
            METRICS_PATH,
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 50.0, 100.0, 250.0,
    ];
    // ingestion lag is measured in seconds, not request time
    const LATENCY_SECONDS: &[f64] = &[0.5, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .set_buckets_for_metric(
            Matcher::Full(LATENCY_HISTOGRAM.to_string()),
            LATENCY_SECONDS,
        )?
        .install_recorder()
}

/// Records request counts and timings for the health and metrics endpoints.
/// Scrapes of `/metrics` are not counted.
pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| UNMATCHED_PATH.to_owned());
    if path == METRICS_PATH {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let start = Instant::now();
    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION, &labels).record(start.elapsed().as_secs_f64());

    response
}
