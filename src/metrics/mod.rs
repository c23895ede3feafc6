//! Metrics module
//!
//! Provides Prometheus metrics for uploads, blocks and remote calls.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "wcs_uploadr_uploads_total",
        "Total number of uploads",
        &["status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "wcs_uploadr_upload_bytes_total",
        "Total bytes acknowledged by the remote"
    ).unwrap();

    pub static ref RESUMED_BYTES_TOTAL: Counter = register_counter!(
        "wcs_uploadr_resumed_bytes_total",
        "Bytes skipped because a previous session already uploaded them"
    ).unwrap();

    pub static ref UPLOAD_DURATION: Histogram = register_histogram!(
        "wcs_uploadr_upload_duration_seconds",
        "Upload duration in seconds",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    // Block metrics
    pub static ref BLOCKS_TOTAL: CounterVec = register_counter_vec!(
        "wcs_uploadr_blocks_total",
        "Blocks handled by workers",
        &["outcome"]  // "complete", "skipped", "failed" or "restarted"
    ).unwrap();

    // Remote call metrics
    pub static ref REMOTE_CALLS: CounterVec = register_counter_vec!(
        "wcs_uploadr_remote_calls_total",
        "Remote calls by stage and outcome",
        &["stage", "outcome"]
    ).unwrap();

    pub static ref RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "wcs_uploadr_retries_total",
        "Calls repeated after a timeout",
        &["stage"]
    ).unwrap();
}

/// Record a finished upload
pub fn record_upload_success(duration_secs: f64) {
    UPLOADS_TOTAL.with_label_values(&["success"]).inc();
    UPLOAD_DURATION.observe(duration_secs);
}

/// Record a failed upload
pub fn record_upload_failure(kind: &str) {
    UPLOADS_TOTAL.with_label_values(&[kind]).inc();
}

/// Record bytes acknowledged by the remote
pub fn record_bytes_acked(bytes: u64) {
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record bytes a resumed session did not need to send again
pub fn record_resumed_bytes(bytes: u64) {
    RESUMED_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a block outcome
pub fn record_block(outcome: &str) {
    BLOCKS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record one remote call
pub fn record_remote_call(stage: &str, outcome: &str) {
    REMOTE_CALLS.with_label_values(&[stage, outcome]).inc();
}

/// Record a retried call
pub fn record_retry(stage: &str) {
    RETRIES_TOTAL.with_label_values(&[stage]).inc();
}

/// Render the default registry in the Prometheus text format
pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_upload_success() {
        record_upload_success(0.5);
        // Just verify it doesn't panic
    }

    #[test]
    fn test_record_upload_failure() {
        record_upload_failure("retry_exhausted");
        // Just verify it doesn't panic
    }

    #[test]
    fn test_record_remote_call() {
        record_remote_call("append-chunk", "timeout");
        record_retry("append-chunk");
        // Just verify it doesn't panic
    }

    #[test]
    fn test_encode_includes_counters() {
        record_block("complete");
        record_bytes_acked(4);
        let text = encode();
        assert!(text.contains("wcs_uploadr_blocks_total"));
        assert!(text.contains("wcs_uploadr_upload_bytes_total"));
    }
}
