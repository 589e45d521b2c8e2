//! Subset ("set") circuit breaking.
//!
//! # Data Flow
//! ```text
//! CallResult with subset / labels
//!     → breaker rule match (source labels, destination subset)
//!     → metric_window.rs classifies the call into local buckets
//!
//! Metric report task (its own interval, apart from instance timing)
//!     → due windows drain and report to the MetricsBackend (retried)
//!     → query the window summary
//!     → chain_data.rs computes the verdict and walks the key's status
//!     → unhealthy sets published to the Service
//! ```
//!
//! # Design Decisions
//! - Verdicts come from the backend's aggregate, so several clients
//!   reporting the same key share one view
//! - Half-open release is a traffic percentage raised step by step, one
//!   metric window apart
//! - Under scope ALL the `subset#` key counts every call of the subset so
//!   it can recover on its own

pub mod backend;
pub mod breaker;
pub mod chain_data;
pub mod metric_window;

pub use backend::{LocalMetricsBackend, MetricKey, MetricSummary, MetricsBackend};
pub use breaker::SetCircuitBreaker;
pub use chain_data::SetChainData;
