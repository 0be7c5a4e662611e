//! Prometheus metrics for buildstash.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides an axum middleware for HTTP RED
//! metrics, and exposes the `/metrics` endpoint handler.
//!
//! The `metrics` macros are no-ops until a recorder is installed, so unit
//! tests never need to call [`init_metrics`].

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "buildstash_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "buildstash_http_request_duration_seconds";

/// Cache operations (counter). Labels: operation (upload|retrieve), outcome.
pub const CACHE_OPERATIONS_TOTAL: &str = "buildstash_cache_operations_total";

/// Credential cache lookups (counter). Labels: result (hit|miss).
pub const CREDENTIAL_CACHE_TOTAL: &str = "buildstash_credential_cache_total";

/// Failed background last-used refreshes (counter).
pub const REFRESH_FAILURES_TOTAL: &str = "buildstash_refresh_failures_total";

/// Sweeper runs (counter). Labels: outcome (ok|error).
pub const SWEEP_RUNS_TOTAL: &str = "buildstash_sweep_runs_total";

/// Stale entries removed by the sweeper (counter).
pub const SWEEP_DELETED_TOTAL: &str = "buildstash_sweep_deleted_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(CACHE_OPERATIONS_TOTAL, "Cache uploads and retrievals by outcome");
    describe_counter!(CREDENTIAL_CACHE_TOTAL, "Credential cache hits and misses");
    describe_counter!(
        REFRESH_FAILURES_TOTAL,
        "Background last-used refreshes that failed"
    );
    describe_counter!(SWEEP_RUNS_TOTAL, "Stale object sweeps by outcome");
    describe_counter!(SWEEP_DELETED_TOTAL, "Stale entries removed by the sweeper");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Collapse a request path to a route template for metric labels, keeping
/// object keys out of label values.
fn normalize_path(path: &str) -> &'static str {
    match path {
        "/health" => "/health",
        "/metrics" => "/metrics",
        p if p.starts_with("/ac/") => "/ac/{key}",
        p if p.starts_with("/cas/") => "/cas/{key}",
        _ => "other",
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_fixed_routes() {
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/metrics"), "/metrics");
    }

    #[test]
    fn test_normalize_path_namespaces() {
        assert_eq!(normalize_path("/ac/0123abcd"), "/ac/{key}");
        assert_eq!(normalize_path("/cas/deadbeef"), "/cas/{key}");
        assert_eq!(normalize_path("/cas/nested/path"), "/cas/{key}");
    }

    #[test]
    fn test_normalize_path_other() {
        assert_eq!(normalize_path("/"), "other");
        assert_eq!(normalize_path("/credentials/alice"), "other");
        assert_eq!(normalize_path("/acx/1"), "other");
    }
}
