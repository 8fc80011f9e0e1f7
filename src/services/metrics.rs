//! Prometheus metrics for the payment reconciliation service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for reconciliation runs by outcome.
pub static RECONCILIATION_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_runs_total",
        "Total number of reconciliation runs",
        &["status"]
    )
    .expect("Failed to register RECONCILIATION_RUNS")
});

/// Counter for persisted matches by type.
pub static MATCHES_CREATED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_matches_total",
        "Total number of persisted reconciliation matches",
        &["match_type"]
    )
    .expect("Failed to register MATCHES_CREATED")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for idempotency guard outcomes.
pub static IDEMPOTENCY_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "idempotency_outcomes_total",
        "Total number of idempotency guard outcomes",
        &["operation", "outcome"]
    )
    .expect("Failed to register IDEMPOTENCY_OUTCOMES")
});

/// Counter for TTL-store failures swallowed by the fail-open policy.
pub static IDEMPOTENCY_STORE_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "idempotency_store_failures_total",
        "TTL store failures absorbed by the fail-open policy",
        &["operation"]
    )
    .expect("Failed to register IDEMPOTENCY_STORE_FAILURES")
});

/// Counter for errors by type.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&RECONCILIATION_RUNS);
    Lazy::force(&MATCHES_CREATED);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&IDEMPOTENCY_OUTCOMES);
    Lazy::force(&IDEMPOTENCY_STORE_FAILURES);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a reconciliation run outcome.
pub fn record_run(status: &str) {
    RECONCILIATION_RUNS.with_label_values(&[status]).inc();
}

/// Record a persisted match.
pub fn record_match(match_type: &str) {
    MATCHES_CREATED.with_label_values(&[match_type]).inc();
}

/// Record an idempotency guard outcome.
pub fn record_idempotency(operation: &str, outcome: &str) {
    IDEMPOTENCY_OUTCOMES
        .with_label_values(&[operation, outcome])
        .inc();
}

/// Record a swallowed TTL-store failure.
pub fn record_idempotency_store_failure(operation: &str) {
    IDEMPOTENCY_STORE_FAILURES
        .with_label_values(&[operation])
        .inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
