//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → PolarisConfig (validated, immutable)
//!     → Context builds balancers, breakers and routers from it
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → static service snapshots are pushed into the registry
//! ```
//!
//! # Design Decisions
//! - Every section has defaults so an empty file is a valid config
//! - Breaker thresholds out of range fall back to defaults at construction
//!   instead of failing the load
//! - Validation separates syntactic (serde) from semantic checks

pub mod duration;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{HealthCheckWhen, LoadBalancerConfig, PolarisConfig};
