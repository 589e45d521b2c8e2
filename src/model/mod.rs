//! Data model shared by the registry, routers, balancers and breakers.
//!
//! # Data Flow
//! ```text
//! ServiceDataSource
//!     → ServiceData (instances | route rule | rate limit | breaker rules)
//!     → registry publishes Arc<ServiceData>
//!     → ServiceInstances (snapshot + Service runtime state + available set)
//!     → routers narrow the available InstancesSet
//!     → balancers pick one Instance using Criteria
//!     → CallResult flows back into the breakers
//! ```
//!
//! # Design Decisions
//! - Snapshots are immutable and shared through `Arc`
//! - Per-service breaker output lives in `Service`, outside the snapshots,
//!   and is swapped atomically by version
//! - InstancesSet carries a process-unique id that keys selector caches

pub mod breaker_rule;
pub mod circuit_breaker;
pub mod criteria;
pub mod instance;
pub mod match_string;
pub mod route_rule;
pub mod service;

pub use circuit_breaker::{CallResult, CallRetStatus, CircuitBreakerStatus};
pub use criteria::Criteria;
pub use instance::{Instance, InstancesData, InstancesSet, Location};
pub use service::{DataStatus, DataType, Service, ServiceData, ServiceDataContent, ServiceInstances, ServiceKey};
