//! Prometheus metrics exposition
//!
//! HTTP metrics are recorded here; engine metrics are recorded by the
//! library crates through the same `metrics` facade:
//!
//! - `idbridge_http_requests_total` (counter): labels `endpoint`, `status`
//! - `idbridge_http_request_duration_seconds` (histogram): label `endpoint`
//! - `idbridge_tokens_issued_total` (counter): label `grant`
//! - `idbridge_refresh_reuse_detected_total` (counter)
//! - `idbridge_key_rotations_total` (counter): label `outcome`

use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "idbridge_http_request_duration_seconds";

/// 1ms to 30s. Token requests are dominated by signing and storage
/// latency; callbacks include the upstream round trip.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed HTTP request.
pub fn record_request(endpoint: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "idbridge_http_requests_total",
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(DURATION_METRIC, "endpoint" => endpoint.to_string())
        .record(duration_secs);
}

/// Middleware recording every routed request under its route template, so
/// that ids in paths do not explode label cardinality.
pub async fn track(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let started = Instant::now();
    let response = next.run(request).await;
    record_request(
        &endpoint,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}
