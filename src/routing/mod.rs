//! Service routing.
//!
//! # Data Flow
//! ```text
//! RouteInfo (callee instances, rules, caller, labels, flags)
//!     → rule_router.rs (route rule match, subset by priority and weight)
//!     → nearby_router.rs (same region / zone / campus, degrade on unhealthy)
//!     → RouteResult: narrowed instances or a redirect
//! ```
//!
//! # Design Decisions
//! - Routers run in configured order; each narrows `available()`
//! - Every router caches its output keyed by the input set id and the
//!   versions that change its decision, so steady traffic only reads
//! - A redirect stops the chain; the caller resolves the new service

pub mod chain;
pub mod nearby_router;
pub mod route_info;
pub mod rule_router;

use std::fmt;
use std::str::FromStr;

use crate::error::PolarisError;

pub use chain::RouterChain;
pub use nearby_router::{ClientLocation, MatchLevel, NearbyRouter};
pub use route_info::{RouteInfo, RouteResult};
pub use rule_router::RuleRouter;

/// Router names accepted in `serviceRouter.chain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterKind {
    RuleBased,
    NearbyBased,
}

impl RouterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouterKind::RuleBased => rule_router::ROUTER_NAME,
            RouterKind::NearbyBased => nearby_router::ROUTER_NAME,
        }
    }
}

impl fmt::Display for RouterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouterKind {
    type Err = PolarisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            rule_router::ROUTER_NAME => Ok(RouterKind::RuleBased),
            nearby_router::ROUTER_NAME => Ok(RouterKind::NearbyBased),
            other => Err(PolarisError::InvalidConfig(format!("unknown router '{}'", other))),
        }
    }
}
