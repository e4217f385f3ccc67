//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (requests, retries, breaker, target health)
//! - Expose a Prometheus-compatible endpoint when enabled
//!
//! # Metrics
//! - `gateway_requests_total` (counter): forwarded requests by service, outcome
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency
//! - `gateway_retries_total` (counter): extra attempts by service
//! - `gateway_breaker_transitions_total` (counter): by target, new state
//! - `gateway_target_health` (gauge): 1=healthy, 0=unhealthy
//! - `gateway_discovery_refresh_total` (counter): by service, result
//!
//! # Design Decisions
//! - Low-overhead metric updates through the `metrics` facade
//! - Labels for service, target, outcome

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::Instant;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(service: &str, outcome: &str, status: u16, start: Instant) {
    metrics::counter!(
        "gateway_requests_total",
        "service" => service.to_string(),
        "outcome" => outcome.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "service" => service.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_retry(service: &str) {
    metrics::counter!("gateway_retries_total", "service" => service.to_string()).increment(1);
}

pub fn record_breaker_transition(target: &str, state: &str) {
    metrics::counter!(
        "gateway_breaker_transitions_total",
        "target" => target.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

pub fn record_target_health(service: &str, target: &str, healthy: bool) {
    metrics::gauge!(
        "gateway_target_health",
        "service" => service.to_string(),
        "target" => target.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_discovery_refresh(service: &str, ok: bool) {
    metrics::counter!(
        "gateway_discovery_refresh_total",
        "service" => service.to_string(),
        "result" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}
