//! Circuit breaking subsystem.
//!
//! # Data Flow
//! ```text
//! CallResult (caller thread)
//!     → executor.rs finds the service's BreakerChain
//!     → chain.rs real-time pass:
//!         - error_count.rs / error_rate.rs update per-instance counters
//!         - transitions go through chain_data.rs (owner check, record, version)
//!         - set/ adds the call to its (subset, labels) metric window
//!     → changed chain data is published to the Service
//!
//! Timing task (every checkPeriod, synchronous)
//!     → chains of departed services dropped
//!     → each breaker's timing pass (sleep window, half-open verdicts)
//!     → expired records cleaned, changes published
//!
//! Set report task (every setCircuitBreaker.reportInterval)
//!     → each service's set breaker, concurrently
//!     → reports, queries and judges its due windows on the blocking pool
//! ```
//!
//! # Design Decisions
//! - The instance breakers form a closed enum instead of a plugin registry
//! - One status map per service records which breaker owns an instance; a
//!   breaker cannot move an instance another breaker holds
//! - Health detection owns one extra slot in that map when it runs always
//! - Transitions never fail; a rejected transition is simply not applied

pub mod chain;
pub mod chain_data;
pub mod error_count;
pub mod error_rate;
pub mod executor;
pub mod set;

use std::fmt;
use std::str::FromStr;

use crate::error::PolarisError;

pub use chain::BreakerChain;
pub use chain_data::{ChainData, StatusHandle};
pub use error_count::ErrorCountBreaker;
pub use error_rate::ErrorRateBreaker;
pub use executor::CircuitBreakerExecutor;

/// Instance breakers that can appear in the configured chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceBreakerKind {
    ErrorCount,
    ErrorRate,
}

impl InstanceBreakerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceBreakerKind::ErrorCount => "errorCount",
            InstanceBreakerKind::ErrorRate => "errorRate",
        }
    }
}

impl fmt::Display for InstanceBreakerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceBreakerKind {
    type Err = PolarisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "errorCount" => Ok(InstanceBreakerKind::ErrorCount),
            "errorRate" => Ok(InstanceBreakerKind::ErrorRate),
            other => Err(PolarisError::InvalidConfig(format!("unknown circuit breaker '{}'", other))),
        }
    }
}

/// A configured instance breaker.
#[derive(Debug)]
pub enum InstanceBreaker {
    ErrorCount(ErrorCountBreaker),
    ErrorRate(ErrorRateBreaker),
}

impl InstanceBreaker {
    pub fn kind(&self) -> InstanceBreakerKind {
        match self {
            InstanceBreaker::ErrorCount(_) => InstanceBreakerKind::ErrorCount,
            InstanceBreaker::ErrorRate(_) => InstanceBreakerKind::ErrorRate,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Trial requests handed to an instance this breaker moved to half open.
    pub fn request_after_half_open(&self) -> u32 {
        match self {
            InstanceBreaker::ErrorCount(b) => b.request_after_half_open(),
            InstanceBreaker::ErrorRate(b) => b.request_after_half_open(),
        }
    }

    pub fn realtime(&self, instance_id: &str, success: bool, handle: &StatusHandle<'_>) {
        match self {
            InstanceBreaker::ErrorCount(b) => b.realtime(instance_id, success, handle),
            InstanceBreaker::ErrorRate(b) => b.realtime(instance_id, success),
        }
    }

    pub fn timing(&self, handle: &StatusHandle<'_>) {
        match self {
            InstanceBreaker::ErrorCount(b) => b.timing(handle),
            InstanceBreaker::ErrorRate(b) => b.timing(handle),
        }
    }

    /// Follow a health probe that moved the instance to half open.
    pub fn detect_to_half_open(&self, instance_id: &str) {
        match self {
            InstanceBreaker::ErrorCount(b) => b.detect_to_half_open(instance_id),
            InstanceBreaker::ErrorRate(b) => b.detect_to_half_open(instance_id),
        }
    }

    pub fn detect_to_close(&self, instance_id: &str) {
        match self {
            InstanceBreaker::ErrorCount(b) => b.detect_to_close(instance_id),
            InstanceBreaker::ErrorRate(b) => b.detect_to_close(instance_id),
        }
    }

    /// Drop records idle past the expiry whose instance is gone.
    pub fn clean_status(&self, handle: &StatusHandle<'_>, exists: &dyn Fn(&str) -> bool) {
        match self {
            InstanceBreaker::ErrorCount(b) => b.clean_status(handle, exists),
            InstanceBreaker::ErrorRate(b) => b.clean_status(handle, exists),
        }
    }
}
