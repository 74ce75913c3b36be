//! Prometheus metrics for rebuild observability.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a bus message received.
pub fn message_received(event_type: &str) {
    counter!("rebuild_messages_received_total", "event_type" => event_type.to_string())
        .increment(1);
}

/// Record an event state transition.
pub fn event_state_changed(state: &str) {
    counter!("rebuild_events_total", "state" => state.to_string()).increment(1);
}

/// Record a build state transition.
pub fn build_state_changed(state: &str) {
    counter!("rebuild_builds_total", "state" => state.to_string()).increment(1);
}

/// Record a submission attempt: ok, transient, permanent or dry_run.
pub fn submission(outcome: &str, duration_ms: u64) {
    counter!("rebuild_submissions_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("rebuild_submission_duration_ms").record(duration_ms as f64);
}

/// Record a task notification: applied, duplicate, held or unknown.
pub fn notification(result: &str) {
    counter!("rebuild_notifications_total", "result" => result.to_string()).increment(1);
}

/// Set the number of submissions currently in flight.
pub fn submissions_in_flight(count: usize) {
    gauge!("rebuild_submissions_in_flight").set(count as f64);
}
