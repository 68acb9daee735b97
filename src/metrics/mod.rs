//! Metrics module
//!
//! Process-wide Prometheus collectors for the chunked upload path.

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_int_gauge, Counter,
    CounterVec, Histogram, IntGauge,
};

lazy_static! {
    // Chunk metrics
    pub static ref CHUNKS_TOTAL: CounterVec = register_counter_vec!(
        "chunk_uploadr_chunks_total",
        "Chunk requests by outcome",
        &["status"]  // "accepted" or "rejected"
    ).unwrap();

    pub static ref CHUNK_BYTES_TOTAL: Counter = register_counter!(
        "chunk_uploadr_chunk_bytes_total",
        "Bytes appended to artifacts by accepted chunks"
    ).unwrap();

    pub static ref CHUNK_DURATION: Histogram = register_histogram!(
        "chunk_uploadr_chunk_duration_seconds",
        "Time spent ingesting one chunk, lock wait included",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    ).unwrap();

    // Session metrics
    pub static ref UPLOADS_COMPLETED: Counter = register_counter!(
        "chunk_uploadr_uploads_completed_total",
        "Uploads whose final chunk was accepted"
    ).unwrap();

    pub static ref SESSIONS_REAPED: Counter = register_counter!(
        "chunk_uploadr_sessions_reaped_total",
        "Sessions retired by idle expiry or abort"
    ).unwrap();

    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!(
        "chunk_uploadr_active_sessions",
        "Upload sessions currently registered"
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "chunk_uploadr_errors_total",
        "Chunk errors by kind",
        &["kind"]
    ).unwrap();
}

/// Record an accepted chunk
pub fn record_chunk_accepted(bytes: u64, duration_secs: f64) {
    CHUNKS_TOTAL.with_label_values(&["accepted"]).inc();
    CHUNK_BYTES_TOTAL.inc_by(bytes as f64);
    CHUNK_DURATION.observe(duration_secs);
}

/// Record a rejected chunk and the error kind that rejected it
pub fn record_chunk_rejected(kind: &str, duration_secs: f64) {
    CHUNKS_TOTAL.with_label_values(&["rejected"]).inc();
    CHUNK_DURATION.observe(duration_secs);
    record_error(kind);
}

/// Record a finalized upload
pub fn record_upload_completed() {
    UPLOADS_COMPLETED.inc();
}

/// Record sessions retired without completing
pub fn record_sessions_reaped(count: usize) {
    SESSIONS_REAPED.inc_by(count as f64);
}

/// Publish the current number of registered sessions
pub fn set_active_sessions(count: usize) {
    ACTIVE_SESSIONS.set(count as i64);
}

/// Record an error
pub fn record_error(kind: &str) {
    ERRORS_TOTAL.with_label_values(&[kind]).inc();
}
