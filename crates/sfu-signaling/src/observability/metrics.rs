//! Metrics definitions for the SFU signaling server.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `event`: 7 values (client request event names)
//! - `outcome`: `success` or a wire error code (~10 values)
//! - `direction`: 2 values (send, recv)
//! - `actor_type`: 2 values (controller, peer)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metric is recorded.
///
/// # Errors
///
/// Returns error if the recorder cannot be installed (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round trips include engine calls; DTLS connect can take seconds.
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                10.000,
            ],
        )
        .map_err(|e| format!("Failed to set request latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room Gauges
// ============================================================================

/// Metric: `sfu_peers_connected`
pub fn set_peers_connected(count: usize) {
    // usize to f64 conversion is safe for realistic peer counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_connected").set(count as f64);
}

/// Metric: `sfu_producers_active`
pub fn set_producers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_producers_active").set(count as f64);
}

/// Metric: `sfu_consumers_active`
pub fn set_consumers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_consumers_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Request Metrics
// ============================================================================

/// Record one handled client request.
///
/// Metrics: `sfu_requests_total`, `sfu_request_duration_seconds`
/// Labels: `event`, `outcome`
pub fn record_request(event: &str, outcome: &str, duration: Duration) {
    counter!("sfu_requests_total",
        "event" => event.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("sfu_request_duration_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `sfu_transports_created_total`
/// Labels: `direction`
pub fn record_transport_created(direction: &str) {
    counter!("sfu_transports_created_total", "direction" => direction.to_string()).increment(1);
}

// ============================================================================
// Failure Counters
// ============================================================================

/// Metric: `sfu_engine_fatal_total`
pub fn record_engine_fatal() {
    counter!("sfu_engine_fatal_total").increment(1);
}

/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Metric: `sfu_notifications_dropped_total`
pub fn record_notification_dropped() {
    counter!("sfu_notifications_dropped_total").increment(1);
}
