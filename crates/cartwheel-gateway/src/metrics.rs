//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    builder
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}

/// Record a new WebSocket connection.
pub fn record_ws_connect() {
    metrics::gauge!("ws_connections_active").increment(1.0);
}

/// Record a WebSocket disconnection.
pub fn record_ws_disconnect() {
    metrics::gauge!("ws_connections_active").decrement(1.0);
}

/// Record a completed graph turn with its duration.
pub fn record_turn(graph: &str, duration_secs: f64) {
    let labels = [("graph", graph.to_string())];
    metrics::counter!("turns_total", &labels).increment(1);
    metrics::histogram!("turn_duration_seconds", &labels).record(duration_secs);
}

/// Record an error surfaced to a client, by wire key.
pub fn record_error(key: &str) {
    let labels = [("key", key.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}
