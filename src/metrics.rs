// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the service.
//
// NOTES:
// - Prometheus pulls; the recorder renders on GET /metrics
// - HTTP metrics are recorded once per request by `middleware::track_metrics`
// - Ledger metrics are recorded by the redemption and assignment services
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES
// =============================================================================

/// HTTP request counter
/// Labels: method, endpoint (matched route), status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// HTTP request duration histogram
/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Redemption attempts
/// Labels: outcome (accepted/rejected)
pub const REDEMPTIONS_TOTAL: &str = "redemptions_total";

/// Units handed out by accepted redemptions
pub const REDEEMED_UNITS_TOTAL: &str = "redeemed_units_total";

/// Assignment instances that reached Completed
pub const PACKAGE_COMPLETIONS_TOTAL: &str = "package_completions_total";

/// Assignment instances created
pub const PACKAGE_ASSIGNMENTS_TOTAL: &str = "package_assignments_total";

/// Storage call duration histogram
/// Labels: operation
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Redis operation duration histogram
/// Labels: operation (get/set/delete/ping)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP
// =============================================================================

fn builder() -> Result<PrometheusBuilder> {
    // 1ms .. 10s
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?;
    Ok(builder)
}

fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(REDEMPTIONS_TOTAL, "Redemption attempts by outcome");
    describe_counter!(REDEEMED_UNITS_TOTAL, "Units handed out by accepted redemptions");
    describe_counter!(
        PACKAGE_COMPLETIONS_TOTAL,
        "Assigned packages that became fully redeemed"
    );
    describe_counter!(PACKAGE_ASSIGNMENTS_TOTAL, "Package assignment instances created");
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Storage call latency in seconds");
    describe_histogram!(REDIS_OPERATION_DURATION_SECONDS, "Redis operation latency in seconds");
}

/// Install the global Prometheus recorder and return the render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let handle = builder()?.install_recorder()?;
    describe_metrics();
    Ok(handle)
}

/// A handle backed by a recorder that is not installed globally.
///
/// Used by router tests, which build many `AppState`s in one process.
#[cfg(test)]
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Record a redemption attempt; rejected attempts carry no units.
pub fn record_redemption(accepted: bool, units: i32) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    counter!(REDEMPTIONS_TOTAL, "outcome" => outcome).increment(1);

    if accepted {
        counter!(REDEEMED_UNITS_TOTAL).increment(u64::try_from(units).unwrap_or(0));
    }
}

pub fn record_completion() {
    counter!(PACKAGE_COMPLETIONS_TOTAL).increment(1);
}

pub fn record_assignments(count: usize) {
    counter!(PACKAGE_ASSIGNMENTS_TOTAL).increment(count as u64);
}

/// Record storage call duration
///
/// # Arguments
/// * `operation` - Logical operation (redeem, insert_package, ...)
/// * `duration_secs` - Call duration in seconds
pub fn record_db_query(operation: &'static str, duration_secs: f64) {
    histogram!(DB_QUERY_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}

/// Record Redis operation duration
pub fn record_redis_operation(operation: &'static str, duration_secs: f64) {
    histogram!(REDIS_OPERATION_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}
