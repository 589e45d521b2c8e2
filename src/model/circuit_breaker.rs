//! Circuit breaker status types and call results.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::model::service::ServiceKey;

/// Breaker status of one instance or one subset key.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CircuitBreakerStatus {
    #[default]
    Close = 0,
    HalfOpen = 1,
    Open = 2,
    /// Degraded but still serving its own traffic.
    Preserved = 3,
}

impl From<u8> for CircuitBreakerStatus {
    fn from(val: u8) -> Self {
        match val {
            1 => CircuitBreakerStatus::HalfOpen,
            2 => CircuitBreakerStatus::Open,
            3 => CircuitBreakerStatus::Preserved,
            _ => CircuitBreakerStatus::Close,
        }
    }
}

impl fmt::Display for CircuitBreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitBreakerStatus::Close => "close",
            CircuitBreakerStatus::HalfOpen => "half_open",
            CircuitBreakerStatus::Open => "open",
            CircuitBreakerStatus::Preserved => "preserved",
        };
        f.write_str(name)
    }
}

/// One audited status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitChangeRecord {
    pub change_time_ms: u64,
    pub change_seq: u64,
    pub from: CircuitBreakerStatus,
    pub to: CircuitBreakerStatus,
    pub reason: String,
}

/// Instance breaker state published to a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerData {
    pub version: u64,
    pub open_instances: HashSet<String>,
    /// Instance id → requests allowed through during the trial.
    pub half_open_instances: HashMap<String, u32>,
}

/// Subset breaker state of one `subset#labels` key.
#[derive(Debug, Clone, PartialEq)]
pub struct SetUnhealthyInfo {
    pub status: CircuitBreakerStatus,
    /// Share of traffic released while half open, in `[0, 1]`.
    pub half_open_release_percent: f32,
    pub open_begin_time_ms: u64,
    pub last_half_open_release_time_ms: u64,
}

impl Default for SetUnhealthyInfo {
    fn default() -> Self {
        Self {
            status: CircuitBreakerStatus::Close,
            half_open_release_percent: 0.0,
            open_begin_time_ms: 0,
            last_half_open_release_time_ms: 0,
        }
    }
}

/// Subset breaker state published to a service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnhealthySetsData {
    pub version: u64,
    pub infos: HashMap<String, SetUnhealthyInfo>,
}

/// Outcome class of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallRetStatus {
    #[default]
    Ok,
    Error,
    Timeout,
}

/// What the caller reports after using an instance.
#[derive(Debug, Clone, Default)]
pub struct CallResult {
    pub service_key: ServiceKey,
    pub instance_id: String,
    pub ret_status: CallRetStatus,
    pub ret_code: i64,
    pub delay_ms: u64,
    /// Subset the instance was chosen from.
    pub subset: BTreeMap<String, String>,
    /// Caller labels, e.g. the method name.
    pub labels: BTreeMap<String, String>,
    pub source: Option<ServiceKey>,
}

impl CallResult {
    pub fn new(service_key: ServiceKey, instance_id: impl Into<String>, ret_status: CallRetStatus) -> Self {
        Self {
            service_key,
            instance_id: instance_id.into(),
            ret_status,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.ret_status == CallRetStatus::Ok
    }
}

/// `k:v|k:v` over sorted keys; empty for an empty map.
pub fn map_to_key(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join("|")
}

/// Key of a subset breaker entry: `subset#labels`.
pub fn subset_label_key(subset: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> String {
    format!("{}#{}", map_to_key(subset), map_to_key(labels))
}

/// Key that breaks every label of a subset.
pub fn subset_all_key(subset: &BTreeMap<String, String>) -> String {
    format!("{}#", map_to_key(subset))
}
