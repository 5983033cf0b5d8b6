//! Prometheus metrics for the API server.

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder. Returns the handle `/metrics` renders.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "vjob_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "vjob_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "vjob_http_requests_in_flight";

    pub const PUSH_DELIVERIES_TOTAL: &str = "vjob_push_deliveries_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a push delivery and the status it was answered with.
pub fn record_push_delivery(kind: &str, status: u16) {
    let labels = [("kind", kind.to_string()), ("status", status.to_string())];
    counter!(names::PUSH_DELIVERIES_TOTAL, &labels).increment(1);
}

/// Metrics middleware for HTTP requests.
///
/// Labels by route template (`/api/jobs/:id`) so ids don't explode the
/// label set; unmatched requests fall back to the raw path.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = match request.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_string(),
        None => request.uri().path().to_string(),
    };
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
    let response = next.run(request).await;
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    record_http_request(&method, &path, status, start.elapsed().as_secs_f64());

    response
}
