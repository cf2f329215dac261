//! Prometheus metrics exposition
//!
//! The pool crate emits its own counters through the `metrics` facade
//! (`pool_acquire_total`, `pool_release_total`, `pool_refresh_total`,
//! `pool_registrations_total`, `pool_leases_reclaimed_total`). This module
//! installs the recorder and adds the service-level series:
//!
//! - `pool_api_requests_total` (counter): labels `status`, `method`
//! - `pool_api_request_duration_seconds` (histogram): label `status`
//! - `pool_accounts` (gauge): label `status`, refreshed on every scrape
//! - `pool_capability_available` (gauge): label `capability`

use account_pool::PoolStatus;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "pool_api_request_duration_seconds";

/// Lease calls answer in milliseconds while `/v1/execute` can run as long as
/// the automation timeout, so the buckets span 5ms to 5 minutes.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0, 300.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("failed to set histogram buckets")
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed API request.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("pool_api_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}

/// Publish account counts as gauges.
pub fn publish_pool_gauges(status: &PoolStatus) {
    for (label, count) in [
        ("active", status.active),
        ("auth_expired", status.auth_expired),
        ("disabled", status.disabled),
        ("busy", status.busy),
    ] {
        metrics::gauge!("pool_accounts", "status" => label).set(count as f64);
    }
    for (capability, counts) in &status.capabilities {
        metrics::gauge!("pool_capability_available", "capability" => capability.as_str())
            .set(counts.available as f64);
    }
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
