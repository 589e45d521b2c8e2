//! Polaris client traffic-governance core.
//!
//! # Architecture Overview
//!
//! ```text
//!   ConsumerApi ──▶ ServiceDataRegistry ──▶ RouterChain ──▶ LoadBalancer ──▶ Instance
//!        │            (snapshots)          rule, nearby     ring hash, maglev,
//!        │                                                   cst hash, random
//!        ▼
//!   CallResult ──▶ CircuitBreakerExecutor ──▶ Service (open / half-open / sets)
//!                   error count, error rate,        │
//!                   set breaker, health probe       └──▶ read back by routers
//!                                                        and balancers
//! ```

pub mod api;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod hash;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod model;
pub mod observability;
pub mod registry;
pub mod routing;
pub mod time;

pub use api::{ConsumerApi, Context, InstanceRequest};
pub use config::schema::PolarisConfig;
pub use error::{PolarisError, PolarisResult};
pub use lifecycle::Shutdown;
