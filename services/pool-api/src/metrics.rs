//! Prometheus metrics exposition
//!
//! Registers and exposes the service metrics:
//!
//! - `pool_api_requests_total` (counter): labels `route`, `status`
//! - `pool_api_request_duration_seconds` (histogram): label `route`
//!
//! The engine's own counters (`pool_admissions_total`,
//! `pool_usage_records_total`) are emitted by `key-pool` and rendered through
//! the same recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "pool_api_request_duration_seconds";

/// Histogram boundaries from 5ms to 10s. Admissions are bounded by one
/// store round trip, so anything past 10s is an outage.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The handle's `render()` method produces the Prometheus text exposition format
/// suitable for serving on a `/metrics` endpoint.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = builder()?.install_recorder()?;
    Ok(handle)
}

/// Record a completed API request with route and status code labels.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("pool_api_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "route" => route).record(duration_secs);
}
