//! Error taxonomy shared by every subsystem.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the client core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolarisError {
    /// No eligible instance left after routing and breaker filtering.
    #[error("no instance available for selection")]
    InstanceNotFound,

    /// Malformed configuration (hash function, table size, thresholds).
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Waiting for service data exceeded the request timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A collaborator could not be reached.
    #[error("network failed: {0}")]
    NetworkFailed(String),

    /// A collaborator answered with an error.
    #[error("server error: {0}")]
    ServerError(String),

    /// Service or data type unknown to the discovery server.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Route rules exist but none matched the caller.
    #[error("route rule not match")]
    RouteRuleNotMatch,
}

/// Numeric codes reported to telemetry and printed by the CLI.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok = 0,
    InvalidArgument = -1001,
    InvalidConfig = -1002,
    ResourceNotFound = -1005,
    Timeout = -1009,
    ServerError = -1010,
    NetworkFailed = -1011,
    InstanceNotFound = -1012,
    RouteRuleNotMatch = -1015,
}

impl PolarisError {
    /// The stable code for this error.
    pub fn code(&self) -> ReturnCode {
        match self {
            PolarisError::InstanceNotFound => ReturnCode::InstanceNotFound,
            PolarisError::InvalidConfig(_) => ReturnCode::InvalidConfig,
            PolarisError::InvalidArgument(_) => ReturnCode::InvalidArgument,
            PolarisError::Timeout(_) => ReturnCode::Timeout,
            PolarisError::NetworkFailed(_) => ReturnCode::NetworkFailed,
            PolarisError::ServerError(_) => ReturnCode::ServerError,
            PolarisError::ResourceNotFound(_) => ReturnCode::ResourceNotFound,
            PolarisError::RouteRuleNotMatch => ReturnCode::RouteRuleNotMatch,
        }
    }
}

pub type PolarisResult<T> = Result<T, PolarisError>;
