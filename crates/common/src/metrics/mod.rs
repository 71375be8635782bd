//! Metrics and observability utilities
//!
//! Prometheus metric descriptions and helpers with standardized naming.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

/// Metrics prefix for all debugtap metrics
pub const METRICS_PREFIX: &str = "debugtap";

/// Histogram buckets for capture overhead (in seconds)
pub const CAPTURE_BUCKETS: &[f64] = &[
    0.0005, // 0.5ms
    0.001,  // 1ms
    0.0025, // 2.5ms
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Resolution metrics
    describe_counter!(
        format!("{}_resolutions_total", METRICS_PREFIX),
        Unit::Count,
        "Session resolutions by outcome"
    );

    // Capture metrics
    describe_counter!(
        format!("{}_captures_total", METRICS_PREFIX),
        Unit::Count,
        "Captured request/response pairs by driver and outcome"
    );

    describe_counter!(
        format!("{}_capture_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Captures that could not be persisted or enqueued"
    );

    describe_histogram!(
        format!("{}_capture_persist_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Time spent persisting or enqueueing a capture"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    // Lifecycle metrics
    describe_counter!(
        format!("{}_lifecycle_sessions_expired_total", METRICS_PREFIX),
        Unit::Count,
        "Sessions flipped inactive after expiry"
    );

    describe_counter!(
        format!("{}_lifecycle_records_pruned_total", METRICS_PREFIX),
        Unit::Count,
        "Records deleted by retention"
    );

    describe_counter!(
        format!("{}_lifecycle_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Lifecycle steps that failed"
    );

    // Worker metrics
    describe_counter!(
        format!("{}_queue_messages_processed_total", METRICS_PREFIX),
        Unit::Count,
        "Total capture jobs processed"
    );

    tracing::info!("Metrics registered");
}

/// Record which step of resolution matched, or "none"/"error"
pub fn record_resolution(outcome: &'static str) {
    counter!(
        format!("{}_resolutions_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a capture hand-off
pub fn record_capture(driver: &'static str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_captures_total", METRICS_PREFIX),
        "driver" => driver,
        "status" => status
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_capture_persist_seconds", METRICS_PREFIX),
            "driver" => driver
        )
        .record(duration_secs);
    } else {
        counter!(
            format!("{}_capture_failures_total", METRICS_PREFIX),
            "driver" => driver
        )
        .increment(1);
    }
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    }
}

/// Record one lifecycle pass
pub fn record_lifecycle(sessions_expired: u64, records_pruned: u64, errors: u64) {
    counter!(format!("{}_lifecycle_sessions_expired_total", METRICS_PREFIX))
        .increment(sessions_expired);
    counter!(format!("{}_lifecycle_records_pruned_total", METRICS_PREFIX))
        .increment(records_pruned);
    if errors > 0 {
        counter!(format!("{}_lifecycle_errors_total", METRICS_PREFIX)).increment(errors);
    }
}

/// Record a processed capture job
pub fn record_job(success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        format!("{}_queue_messages_processed_total", METRICS_PREFIX),
        "status" => status
    )
    .increment(1);
}
