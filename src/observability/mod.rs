//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! balancers, breakers, routers, registry, caches
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout log stream
//!     → Prometheus scrape endpoint (runtime binary only)
//! ```
//!
//! # Design Decisions
//! - The library only emits; installing subscribers and exporters is left to binaries
//! - Metric updates go through the `metrics` facade and cost nothing without a recorder
//! - Labels stay low-cardinality: balancer type, breaker scope, status, data type

pub mod logging;
pub mod metrics;
