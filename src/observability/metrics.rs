//! Metrics collection and exposition.
//!
//! # Metrics
//! - `rpc_connections_total` (counter): accepted connections
//! - `rpc_active_connections` (gauge): registered connections
//! - `rpc_disconnects_total` (counter): sessions ended, by reason
//! - `rpc_requests_total` (counter): handler calls by method, outcome
//! - `rpc_request_duration_seconds` (histogram): handler latency
//!
//! Recording is a no-op until a recorder is installed. Calls the handler
//! rejects with "method not found" share the `unknown` method label, so
//! client-chosen names never become new series.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::rpc::message::METHOD_NOT_FOUND;

/// Method label for calls the handler does not recognise.
pub const UNKNOWN_METHOD: &str = "unknown";

/// Install the Prometheus recorder and its HTTP scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_opened() {
    ::metrics::counter!("rpc_connections_total").increment(1);
    ::metrics::gauge!("rpc_active_connections").increment(1.0);
}

pub fn record_connection_closed(reason: &'static str) {
    ::metrics::gauge!("rpc_active_connections").decrement(1.0);
    ::metrics::counter!("rpc_disconnects_total", "reason" => reason).increment(1);
}

/// Record one handler call. `error_code` is `None` on success.
pub fn record_request(method: &str, error_code: Option<i64>, started: Instant) {
    let (method, outcome) = request_labels(method, error_code);
    ::metrics::counter!(
        "rpc_requests_total",
        "method" => method.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    ::metrics::histogram!("rpc_request_duration_seconds", "method" => method.to_string())
        .record(started.elapsed().as_secs_f64());
}

fn request_labels(method: &str, error_code: Option<i64>) -> (&str, &'static str) {
    match error_code {
        None => (method, "ok"),
        Some(METHOD_NOT_FOUND) => (UNKNOWN_METHOD, "error"),
        Some(_) => (method, "error"),
    }
}
