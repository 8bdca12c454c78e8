//! Metrics
//!
//! Process-wide Prometheus collectors. Everything registers against the
//! default registry at first touch; `render` produces the text exposition
//! served by `GET /metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};

/// Completed requests by operation, method, and status code
pub static REQUESTS_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "muskie_requests_completed_total",
        "Number of requests completed",
        &["operation", "method", "status_code"]
    )
    .unwrap()
});

/// Time to first byte, milliseconds
pub static TIME_TO_FIRST_BYTE: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "muskie_time_to_first_byte_ms",
        "Time from request start until the first response byte",
        &["operation", "method", "status_code"],
        prometheus::exponential_buckets(1.0, 2.0, 14).unwrap()
    )
    .unwrap()
});

/// Total request latency, milliseconds
pub static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "muskie_request_duration_ms",
        "Total time spent handling a request",
        &["operation", "method", "status_code"],
        prometheus::exponential_buckets(1.0, 2.0, 16).unwrap()
    )
    .unwrap()
});

/// Bytes streamed in from clients
pub static INBOUND_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "muskie_inbound_streamed_bytes_total",
        "Bytes received in streamed request bodies"
    )
    .unwrap()
});

/// Bytes streamed out to clients
pub static OUTBOUND_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "muskie_outbound_streamed_bytes_total",
        "Bytes sent in streamed response bodies"
    )
    .unwrap()
});

/// Logical bytes deleted (content_length x copies), by accelerated-GC eligibility
pub static DELETED_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "muskie_deleted_bytes_total",
        "Logical object bytes deleted",
        &["accelerated_gc"]
    )
    .unwrap()
});

/// Directories deleted
pub static DELETED_DIRECTORIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "muskie_deleted_directories_total",
        "Directories deleted"
    )
    .unwrap()
});

/// Requests released by the throttle reaper rather than their handler
pub static THROTTLE_REAPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "muskie_throttle_reaped_total",
        "Admission slots released by the reaper"
    )
    .unwrap()
});

/// Record a completed request
pub fn observe_request(operation: &str, method: &str, status: u16, duration_ms: f64) {
    let status = status.to_string();
    REQUESTS_COMPLETED
        .with_label_values(&[operation, method, &status])
        .inc();
    REQUEST_DURATION
        .with_label_values(&[operation, method, &status])
        .observe(duration_ms);
}

/// Record time-to-first-byte for a completed request
pub fn observe_ttfb(operation: &str, method: &str, status: u16, ttfb_ms: f64) {
    TIME_TO_FIRST_BYTE
        .with_label_values(&[operation, method, &status.to_string()])
        .observe(ttfb_ms);
}

/// Prometheus text exposition of the default registry
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buf) {
        tracing::error!(%err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
