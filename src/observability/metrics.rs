//! Metrics collection and exposition.
//!
//! # Metrics
//! - `mux_connections_total` (counter): classified connections by listener
//! - `mux_rejected_total` (counter): connections closed on queue overflow
//! - `mux_classification_errors_total` (counter): unreadable connections
//! - `trace_spans_finished_total` (counter): finished, sampled spans
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Labels are static strings (protocol class or "default")

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection(listener: &'static str) {
    ::metrics::counter!("mux_connections_total", "listener" => listener).increment(1);
}

pub fn record_rejected(listener: &'static str) {
    ::metrics::counter!("mux_rejected_total", "listener" => listener).increment(1);
}

pub fn record_classification_error() {
    ::metrics::counter!("mux_classification_errors_total").increment(1);
}

pub fn record_span_finished() {
    ::metrics::counter!("trace_spans_finished_total").increment(1);
}
