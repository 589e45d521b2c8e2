//! Consumer-facing API.
//!
//! # Data Flow
//! ```text
//! InstanceRequest
//!     → consumer.rs waits for the service's instances and route rules
//!     → RouterChain narrows them (redirects followed)
//!     → LoadBalancer picks one instance
//!
//! CallResult
//!     → CircuitBreakerExecutor (real-time pass)
//! ```
//!
//! # Design Decisions
//! - Calls are synchronous; only background work runs on tokio
//! - One `Context` per client owns every shared cache and task

pub mod consumer;
pub mod context;

pub use consumer::{ConsumerApi, InstanceRequest, InstancesResponse};
pub use context::Context;
