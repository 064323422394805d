//! Metrics definitions for the Call Controller.
//!
//! Prometheus naming conventions: `cc_` prefix, `_total` suffix for
//! counters, `_seconds` suffix for duration histograms.
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `event`: the six inbound frame tags plus `unparseable`
//! - `frame`: the nine outbound frame tags
//! - `operation`: bounded by code (create_session, settle_session, ...)
//! - `status`: "success" / "error"
//! - `outcome`: "completed" / "declined" / "already_settled" / "failed"
//! - `deduction`: "weekly" / "bundle" / "none"

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle the gateway serves
/// `/metrics` from. Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Store round trips; aligned with the 3s store deadline
        .set_buckets_for_metric(
            Matcher::Prefix("cc_store_query".to_string()),
            &[
                0.001, 0.002, 0.005, 0.010, 0.020, 0.050, 0.100, 0.250, 0.500, 1.000, 3.000,
            ],
        )
        .map_err(|e| format!("Failed to set store query buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

/// Record an inbound event and how it resolved.
///
/// Metric: `cc_events_total`
/// Labels: `event` (frame tag or "unparseable"), `status` ("success" / "error")
pub fn record_event(event: &str, status: &str) {
    counter!("cc_events_total",
        "event" => event.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a durable-store query.
///
/// Metric: `cc_store_query_duration_seconds`, `cc_store_queries_total`
/// Labels: `operation`, `status`
pub fn record_store_query(operation: &str, status: &str, duration: Duration) {
    histogram!("cc_store_query_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("cc_store_queries_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a settlement outcome and which balance leg (if any) was deducted.
///
/// Metric: `cc_settlements_total`
/// Labels: `outcome`, `deduction`
pub fn record_settlement(outcome: &str, deduction: &str) {
    counter!("cc_settlements_total",
        "outcome" => outcome.to_string(),
        "deduction" => deduction.to_string()
    )
    .increment(1);
}

/// Record one roster broadcast fan-out.
///
/// Metric: `cc_broadcasts_total`
pub fn record_broadcast() {
    counter!("cc_broadcasts_total").increment(1);
}

/// Record an outbound frame handed to a connection actor.
///
/// Metric: `cc_frames_delivered_total`
/// Labels: `frame`
pub fn record_frame_delivered(frame: &str) {
    counter!("cc_frames_delivered_total", "frame" => frame.to_string()).increment(1);
}

/// Record an outbound frame dropped because a connection mailbox was full
/// or closed.
///
/// Metric: `cc_frames_dropped_total`
/// Labels: `frame`
pub fn record_frame_dropped(frame: &str) {
    counter!("cc_frames_dropped_total", "frame" => frame.to_string()).increment(1);
}

/// Set the registry size gauges after a mutation.
///
/// Metric: `cc_online_participants`, `cc_active_calls`
pub fn set_registry_gauges(online: usize, active_calls: usize) {
    gauge!("cc_online_participants").set(online as f64);
    gauge!("cc_active_calls").set(active_calls as f64);
}

/// Set the mailbox depth gauge for one actor type.
///
/// For connection actors (many instances) the gauge is last-writer-wins and
/// only approximate; the registry gauge is exact.
///
/// Metric: `cc_mailbox_depth`
/// Labels: `actor`
pub fn set_mailbox_depth(actor: &str, depth: usize) {
    gauge!("cc_mailbox_depth", "actor" => actor.to_string()).set(depth as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests execute the recording functions for coverage. Without an
    // installed recorder the metrics crate routes to a global no-op, which
    // is sufficient; none of these calls may panic.

    #[test]
    fn test_record_event() {
        record_event("registerUser", "success");
        record_event("requestCall", "error");
        record_event("submitFeedback", "error");
        record_event("unparseable", "error");
    }

    #[test]
    fn test_record_store_query() {
        record_store_query("create_session", "success", Duration::from_millis(4));
        record_store_query("settle_session", "success", Duration::from_millis(9));
        record_store_query("deduct_weekly", "error", Duration::from_millis(40));
    }

    #[test]
    fn test_record_settlement() {
        record_settlement("completed", "weekly");
        record_settlement("completed", "bundle");
        record_settlement("completed", "none");
        record_settlement("declined", "none");
        record_settlement("already_settled", "none");
        record_settlement("failed", "none");
    }

    #[test]
    fn test_frame_and_broadcast_counters() {
        record_broadcast();
        record_frame_delivered("presenceSnapshot");
        record_frame_dropped("callEnded");
    }

    #[test]
    fn test_set_registry_gauges() {
        set_registry_gauges(0, 0);
        set_registry_gauges(12, 3);
    }

    #[test]
    fn test_set_mailbox_depth() {
        set_mailbox_depth("registry", 0);
        set_mailbox_depth("connection", 17);
    }
}
