//! Active health detection.
//!
//! # Data Flow
//! ```text
//! Periodic timer (healthCheck.interval)
//!     → checker.rs walks every service with a breaker chain
//!     → probe.rs detects each candidate instance (retried on failure)
//!     → BreakerChain::translate_status moves the instance
//! ```
//!
//! # Design Decisions
//! - onRecover only probes Open instances; breakers never half-open them
//!   on their own in that mode
//! - always gives detection its own slot in the chain, so it opens and
//!   closes instances independently of the breakers
//! - Probes are a trait object so tests and other protocols can plug in

pub mod checker;
pub mod probe;

pub use checker::HealthChecker;
pub use probe::{DetectResult, HealthProbe, TcpProbe};
