//! Circuit breaker rule payload for subset ("set") breaking.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::match_string::{map_match, MatchString, WILDCARD};
use crate::model::service::ServiceKey;

pub const DEFAULT_SET_SLEEP_WINDOW_MS: u64 = 600_000;
pub const DEFAULT_SET_METRIC_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_SET_METRIC_PRECISION: u32 = 12;
pub const DEFAULT_SET_UPDATE_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_VOLUME_THRESHOLD: u64 = 10;

/// Whether an Open label also breaks the rest of its subset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BreakScope {
    #[default]
    Labels,
    All,
}

/// Rate thresholds for one class of specific error codes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpecialErrorPolicy {
    /// Dimension name the metric backend counts under.
    pub name: String,
    pub error_codes: Vec<i64>,
    pub error_rate_to_open: u32,
    pub error_rate_to_preserved: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorRatePolicy {
    pub enable: bool,
    pub request_volume_threshold: u64,
    /// Percent.
    pub error_rate_to_open: u32,
    /// Percent.
    pub error_rate_to_preserved: u32,
    pub specials: Vec<SpecialErrorPolicy>,
}

impl Default for ErrorRatePolicy {
    fn default() -> Self {
        Self {
            enable: true,
            request_volume_threshold: DEFAULT_REQUEST_VOLUME_THRESHOLD,
            error_rate_to_open: 50,
            error_rate_to_preserved: 20,
            specials: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SlowRatePolicy {
    pub enable: bool,
    /// Calls at or above this delay count as slow.
    pub max_rt_ms: u64,
    pub slow_rate_to_open: u32,
    pub slow_rate_to_preserved: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakPolicy {
    pub error_rate: ErrorRatePolicy,
    pub slow_rate: SlowRatePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoverPolicy {
    pub sleep_window_ms: u64,
    /// Half-open release steps in percent, ascending.
    pub request_rate_after_half_open: Vec<u32>,
}

impl Default for RecoverPolicy {
    fn default() -> Self {
        Self {
            sleep_window_ms: DEFAULT_SET_SLEEP_WINDOW_MS,
            request_rate_after_half_open: Vec::new(),
        }
    }
}

/// A destination of a breaker rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DestinationSet {
    pub namespace: String,
    pub service: String,
    /// Subset matchers.
    pub metadata: BTreeMap<String, MatchString>,
    pub scope: BreakScope,
    pub policy: BreakPolicy,
    pub recover: RecoverPolicy,
    pub metric_window_ms: u64,
    pub metric_precision: u32,
    pub update_interval_ms: u64,
}

impl Default for DestinationSet {
    fn default() -> Self {
        Self {
            namespace: WILDCARD.to_string(),
            service: WILDCARD.to_string(),
            metadata: BTreeMap::new(),
            scope: BreakScope::default(),
            policy: BreakPolicy::default(),
            recover: RecoverPolicy::default(),
            metric_window_ms: DEFAULT_SET_METRIC_WINDOW_MS,
            metric_precision: DEFAULT_SET_METRIC_PRECISION,
            update_interval_ms: DEFAULT_SET_UPDATE_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceMatcher {
    pub namespace: String,
    pub service: String,
    pub labels: BTreeMap<String, MatchString>,
}

impl Default for SourceMatcher {
    fn default() -> Self {
        Self {
            namespace: WILDCARD.to_string(),
            service: WILDCARD.to_string(),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CbRule {
    pub sources: Vec<SourceMatcher>,
    pub destinations: Vec<DestinationSet>,
}

/// Breaker configuration of one service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerRules {
    pub id: String,
    pub inbounds: Vec<CbRule>,
}

fn name_and_service_match(rule_ns: &str, rule_svc: &str, key: &ServiceKey) -> bool {
    (rule_ns == key.namespace || rule_ns == WILDCARD) && (rule_svc == key.name || rule_svc == WILDCARD)
}

fn labels_match(rule: &BTreeMap<String, MatchString>, actual: &BTreeMap<String, String>) -> bool {
    if rule.is_empty() {
        return actual.is_empty();
    }
    !actual.is_empty() && map_match(rule, actual)
}

impl CircuitBreakerRules {
    /// Find the destination set governing a call from `source` with `labels`
    /// into `subset` of `service`.
    pub fn match_destination(
        &self,
        source: Option<&ServiceKey>,
        labels: &BTreeMap<String, String>,
        service: &ServiceKey,
        subset: &BTreeMap<String, String>,
    ) -> Option<&DestinationSet> {
        let empty = ServiceKey::default();
        let source = source.unwrap_or(&empty);
        for rule in &self.inbounds {
            let source_matched = rule.sources.iter().any(|s| {
                name_and_service_match(&s.namespace, &s.service, source) && labels_match(&s.labels, labels)
            });
            if !source_matched {
                continue;
            }
            let found = rule.destinations.iter().find(|d| {
                name_and_service_match(&d.namespace, &d.service, service)
                    && ((d.metadata.is_empty() && subset.is_empty()) || map_match(&d.metadata, subset))
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn rules() -> CircuitBreakerRules {
        let text = r#"
            id = "cb-1"
            [[inbounds]]
            [[inbounds.sources]]
            [inbounds.sources.labels.method]
            value = "Get"

            [[inbounds.destinations]]
            scope = "ALL"
            [inbounds.destinations.metadata.set]
            value = "s1"
            [inbounds.destinations.recover]
            requestRateAfterHalfOpen = [20, 40]
        "#;
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_parse_defaults() {
        let rules = rules();
        let dst = &rules.inbounds[0].destinations[0];
        assert_eq!(dst.scope, BreakScope::All);
        assert_eq!(dst.recover.sleep_window_ms, DEFAULT_SET_SLEEP_WINDOW_MS);
        assert_eq!(dst.recover.request_rate_after_half_open, vec![20, 40]);
        assert!(dst.policy.error_rate.enable);
    }

    #[test]
    fn test_match_destination() {
        let rules = rules();
        let service = ServiceKey::new("Test", "svc");
        let hit = rules.match_destination(None, &map(&[("method", "Get")]), &service, &map(&[("set", "s1")]));
        assert!(hit.is_some());
        let miss_labels = rules.match_destination(None, &map(&[]), &service, &map(&[("set", "s1")]));
        assert!(miss_labels.is_none());
        let miss_subset = rules.match_destination(None, &map(&[("method", "Get")]), &service, &map(&[("set", "s2")]));
        assert!(miss_subset.is_none());
    }
}
