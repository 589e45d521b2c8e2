//! Route rule payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::match_string::{map_match_collect, MatchString, WILDCARD};
use crate::model::service::ServiceKey;

pub const DEFAULT_DESTINATION_PRIORITY: u32 = 9;

fn default_priority() -> u32 {
    DEFAULT_DESTINATION_PRIORITY
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

fn name_matches(rule_value: &str, actual: &str) -> bool {
    rule_value == WILDCARD || rule_value == actual
}

/// Caller matcher of a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default = "wildcard")]
    pub namespace: String,
    #[serde(default = "wildcard")]
    pub service: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, MatchString>,
}

impl Source {
    pub fn matches(
        &self,
        service_key: &ServiceKey,
        metadata: &BTreeMap<String, String>,
        parameters: &mut String,
    ) -> bool {
        name_matches(&self.namespace, &service_key.namespace)
            && name_matches(&self.service, &service_key.name)
            && map_match_collect(&self.metadata, metadata, parameters)
    }

    pub fn is_wildcard(&self) -> bool {
        self.namespace == WILDCARD && self.service == WILDCARD && self.metadata.is_empty()
    }
}

/// Target subset of a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    #[serde(default = "wildcard")]
    pub namespace: String,
    #[serde(default = "wildcard")]
    pub service: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, MatchString>,
    /// Lower value is preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub isolate: bool,
    /// Redirect to another service of the same namespace.
    #[serde(default)]
    pub transfer: Option<String>,
}

impl Destination {
    pub fn matches_service(&self, service_key: &ServiceKey) -> bool {
        name_matches(&self.namespace, &service_key.namespace)
            && name_matches(&self.service, &service_key.name)
    }
}

/// Sources plus prioritized destinations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Route {
    pub sources: Vec<Source>,
    pub destinations: Vec<Destination>,
}

/// Caller description used for rule matching.
#[derive(Debug, Clone, Default)]
pub struct SourceService {
    pub service_key: Option<ServiceKey>,
    pub metadata: BTreeMap<String, String>,
}

impl Route {
    /// Whether the caller matches; collects bound parameter values.
    pub fn match_source(&self, source: Option<&SourceService>, parameters: &mut String) -> bool {
        match source {
            Some(source) => {
                let empty = ServiceKey::default();
                let key = source.service_key.as_ref().unwrap_or(&empty);
                if self.sources.iter().any(|s| s.matches(key, &source.metadata, parameters)) {
                    return true;
                }
            }
            None => {
                if self.sources.iter().any(Source::is_wildcard) {
                    return true;
                }
            }
        }
        self.sources.is_empty()
    }

    /// Destinations grouped by ascending priority.
    pub fn destinations_by_priority(&self) -> BTreeMap<u32, Vec<&Destination>> {
        let mut grouped: BTreeMap<u32, Vec<&Destination>> = BTreeMap::new();
        for destination in &self.destinations {
            grouped.entry(destination.priority).or_default().push(destination);
        }
        grouped
    }
}

/// Inbound rules of the callee and outbound rules of the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteRuleData {
    pub inbounds: Vec<Route>,
    pub outbounds: Vec<Route>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_from_toml() {
        let text = r#"
            [[inbounds]]
            [[inbounds.sources]]
            service = "caller"
            namespace = "Test"
            [inbounds.sources.metadata.env]
            value = "gray"

            [[inbounds.destinations]]
            weight = 100
            priority = 0
            [inbounds.destinations.metadata.version]
            value = "v2"

            [[inbounds.destinations]]
            weight = 100
        "#;
        let rule: RouteRuleData = toml::from_str(text).unwrap();
        let route = &rule.inbounds[0];
        let grouped = route.destinations_by_priority();
        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), vec![0, 9]);

        let mut params = String::new();
        let mut meta = BTreeMap::new();
        meta.insert("env".to_string(), "gray".to_string());
        let caller = SourceService {
            service_key: Some(ServiceKey::new("Test", "caller")),
            metadata: meta,
        };
        assert!(route.match_source(Some(&caller), &mut params));
        assert!(!route.match_source(None, &mut params));
    }

    #[test]
    fn test_empty_sources_match_everything() {
        let route = Route::default();
        let mut params = String::new();
        assert!(route.match_source(None, &mut params));
    }
}
