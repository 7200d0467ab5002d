//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_accepted_total` (counter): client connections accepted
//! - `proxy_requests_total` (counter): request heads parsed, by method
//! - `proxy_responses_spooled_total` (counter): responses that fell back to
//!   the disk-backed streaming buffer
//! - `proxy_gateway_errors_total` (counter): 502 responses sent
//! - `proxy_connections_reaped_total` (counter): connections reclaimed by the
//!   expiry policy, by reason
//! - `proxy_interest_set_size` (gauge): connections waiting on readiness

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Installs the Prometheus recorder with its scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_accept() {
    ::metrics::counter!("proxy_connections_accepted_total").increment(1);
}

pub fn record_request(method: &str) {
    ::metrics::counter!("proxy_requests_total", "method" => method.to_string()).increment(1);
}

pub fn record_spooled() {
    ::metrics::counter!("proxy_responses_spooled_total").increment(1);
}

pub fn record_gateway_error() {
    ::metrics::counter!("proxy_gateway_errors_total").increment(1);
}

pub fn record_reaped(reason: &'static str, count: usize) {
    ::metrics::counter!("proxy_connections_reaped_total", "reason" => reason).increment(count as u64);
}

pub fn set_interest_set_size(size: usize) {
    ::metrics::gauge!("proxy_interest_set_size").set(size as f64);
}
