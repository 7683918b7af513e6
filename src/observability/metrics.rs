//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ws_sessions_dialed_total` (counter): outbound dials by result
//! - `ws_sessions_evicted_total` (counter): cache evictions by cause
//! - `ws_probe_failures_total` (counter): keepalive probe failures by kind
//! - `ws_reconnect_attempts_total` (counter): reconnect attempts by result
//! - `ws_admission_rejected_total` (counter): rejected inbound sessions by service
//! - `ws_inbound_sessions` (gauge): sessions currently registered
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is only installed by the binary

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_dial(success: bool) {
    let result = if success { "ok" } else { "error" };
    counter!("ws_sessions_dialed_total", "result" => result).increment(1);
}

pub fn record_eviction(cause: &'static str) {
    counter!("ws_sessions_evicted_total", "cause" => cause).increment(1);
}

pub fn record_probe_failure(kind: &'static str) {
    counter!("ws_probe_failures_total", "kind" => kind).increment(1);
}

pub fn record_reconnect_attempt(success: bool) {
    let result = if success { "ok" } else { "error" };
    counter!("ws_reconnect_attempts_total", "result" => result).increment(1);
}

pub fn record_admission_rejected(service: &str) {
    counter!("ws_admission_rejected_total", "service" => service.to_owned()).increment(1);
}

pub fn record_inbound_sessions(delta: f64) {
    gauge!("ws_inbound_sessions").increment(delta);
}
