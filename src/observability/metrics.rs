//! Metrics collection and exposition.
//!
//! # Metrics
//! - `polaris_lb_select_total` (counter): selections by balancer type and result
//! - `polaris_lb_cache_builds_total` (counter): selector builds by balancer type
//! - `polaris_circuit_breaker_transitions_total` (counter): status changes by scope
//! - `polaris_registry_updates_total` (counter): published snapshots by data type
//! - `polaris_route_recover_all_total` (counter): recover-all fallbacks by router
//! - `polaris_cache_entries` (gauge): entries held per cache
//!
//! # Design Decisions
//! - Helpers keep metric names in one place
//! - Without an installed recorder every call is a no-op

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::model::CircuitBreakerStatus;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_lb_select(lb_type: &'static str, found: bool) {
    let result = if found { "ok" } else { "not_found" };
    ::metrics::counter!("polaris_lb_select_total", "lb_type" => lb_type, "result" => result).increment(1);
}

pub fn record_lb_cache_build(lb_type: &'static str) {
    ::metrics::counter!("polaris_lb_cache_builds_total", "lb_type" => lb_type).increment(1);
}

pub fn record_breaker_transition(scope: &'static str, from: CircuitBreakerStatus, to: CircuitBreakerStatus) {
    ::metrics::counter!(
        "polaris_circuit_breaker_transitions_total",
        "scope" => scope,
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_registry_update(data_type: &'static str) {
    ::metrics::counter!("polaris_registry_updates_total", "data_type" => data_type).increment(1);
}

pub fn record_recover_all(router: &'static str) {
    ::metrics::counter!("polaris_route_recover_all_total", "router" => router).increment(1);
}

pub fn record_cache_entries(cache: &'static str, entries: usize) {
    ::metrics::gauge!("polaris_cache_entries", "cache" => cache).set(entries as f64);
}
