//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the client.
//! All types derive Serde traits for deserialization from config files.
//! Option names are camelCase; durations accept milliseconds or unit strings.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration;
use crate::model::breaker_rule::CircuitBreakerRules;
use crate::model::route_rule::RouteRuleData;
use crate::model::{Instance, InstancesData, Location, ServiceData, ServiceDataContent, ServiceKey};

/// Root configuration for the client.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PolarisConfig {
    /// Timeouts, cache expiry and the client's own location.
    pub global: GlobalConfig,

    /// Consumer-side traffic governance.
    pub consumer: ConsumerConfig,

    /// Logging and metrics exposition.
    pub observability: ObservabilityConfig,

    /// Services served from this file instead of a discovery server.
    pub services: Vec<StaticServiceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Default wait for service data on a consumer call.
    #[serde(with = "duration")]
    pub api_timeout: Duration,

    /// Idle time after which cached selectors and route results are dropped.
    #[serde(with = "duration")]
    pub cache_clear_time: Duration,

    /// Location of this client, used by the nearby router.
    pub location: Location,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            api_timeout: Duration::from_millis(1000),
            cache_clear_time: Duration::from_secs(60),
            location: Location::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsumerConfig {
    pub load_balancer: LoadBalancerConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health_check: HealthCheckConfig,
    pub service_router: ServiceRouterConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    /// Default balancer: weightedRandom, ringHash, maglev, l5CstHash,
    /// cMurmurHash or simpleHash.
    #[serde(rename = "type")]
    pub lb_type: String,

    /// Ring hash virtual nodes per base weight. Unset: 1024, or 10 with
    /// `compatibleGo`.
    pub vnode_count: Option<u32>,

    /// Hash function name for ring hash and Maglev.
    pub hash_func: String,

    /// Place ring nodes the way the Go client does.
    pub compatible_go: bool,

    /// Weight that maps to exactly `vnodeCount` nodes; 0 derives it.
    pub base_weight: u32,

    /// Maglev table size; must be prime.
    pub table_size: u32,

    /// Weighted random uses dynamic weights when present.
    pub enable_dynamic_weight: bool,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            lb_type: "weightedRandom".to_string(),
            vnode_count: None,
            hash_func: "murmur3".to_string(),
            compatible_go: false,
            base_weight: 0,
            table_size: 65_537,
            enable_dynamic_weight: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub enable: bool,

    /// Period of the timing checks; at least 100ms.
    #[serde(with = "duration")]
    pub check_period: Duration,

    /// Instance breakers in evaluation order: errorCount, errorRate.
    pub chain: Vec<String>,

    pub error_count: ErrorCountConfig,
    pub error_rate: ErrorRateConfig,
    pub set_circuit_breaker: SetCircuitBreakerConfig,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            check_period: Duration::from_millis(1000),
            chain: vec!["errorCount".to_string(), "errorRate".to_string()],
            error_count: ErrorCountConfig::default(),
            error_rate: ErrorRateConfig::default(),
            set_circuit_breaker: SetCircuitBreakerConfig::default(),
        }
    }
}

/// Consecutive-error breaker. Non-positive values fall back to defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorCountConfig {
    pub continuous_error_threshold: i64,
    #[serde(with = "duration")]
    pub sleep_window: Duration,
    pub request_count_after_half_open: i64,
    pub success_count_after_half_open: i64,
    /// Half-open errors that reopen the instance; unset means
    /// `requestCountAfterHalfOpen - successCountAfterHalfOpen + 1`.
    pub error_count_after_half_open: Option<u32>,
    #[serde(with = "duration")]
    pub metric_expired_time: Duration,
}

impl Default for ErrorCountConfig {
    fn default() -> Self {
        Self {
            continuous_error_threshold: 10,
            sleep_window: Duration::from_secs(30),
            request_count_after_half_open: 10,
            success_count_after_half_open: 8,
            error_count_after_half_open: None,
            metric_expired_time: Duration::from_secs(3600),
        }
    }
}

/// Sliding-window error-rate breaker. Invalid values fall back to defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorRateConfig {
    pub request_volume_threshold: i64,
    /// Fraction in (0, 1).
    pub error_rate_threshold: f64,
    #[serde(with = "duration")]
    pub metric_stat_time_window: Duration,
    pub metric_num_buckets: i64,
    #[serde(with = "duration")]
    pub sleep_window: Duration,
    pub request_count_after_half_open: i64,
    pub success_count_after_half_open: i64,
    #[serde(with = "duration")]
    pub metric_expired_time: Duration,
}

impl Default for ErrorRateConfig {
    fn default() -> Self {
        Self {
            request_volume_threshold: 10,
            error_rate_threshold: 0.5,
            metric_stat_time_window: Duration::from_secs(60),
            metric_num_buckets: 12,
            sleep_window: Duration::from_secs(30),
            request_count_after_half_open: 10,
            success_count_after_half_open: 8,
            metric_expired_time: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SetCircuitBreakerConfig {
    pub enable: bool,
    /// How often the metric report task looks for due subset windows.
    #[serde(with = "duration")]
    pub report_interval: Duration,
}

impl Default for SetCircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            report_interval: Duration::from_millis(1000),
        }
    }
}

/// When active health detection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum HealthCheckWhen {
    #[default]
    Never,
    /// Probe open instances only, moving recovered ones to half open.
    OnRecover,
    /// Probe every instance; the probe alone opens and closes.
    Always,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub when: HealthCheckWhen,
    #[serde(with = "duration")]
    pub interval: Duration,
    /// Probe timeout.
    #[serde(with = "duration")]
    pub timeout: Duration,
    /// Extra attempts after a failed probe.
    pub retry: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            when: HealthCheckWhen::Never,
            interval: Duration::from_secs(10),
            timeout: Duration::from_millis(500),
            retry: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceRouterConfig {
    /// Routers in order: ruleBasedRouter, nearbyBasedRouter.
    pub chain: Vec<String>,
    pub rule_based_router: RuleRouterConfig,
    pub nearby_based_router: NearbyRouterConfig,
}

impl Default for ServiceRouterConfig {
    fn default() -> Self {
        Self {
            chain: vec!["ruleBasedRouter".to_string(), "nearbyBasedRouter".to_string()],
            rule_based_router: RuleRouterConfig::default(),
            nearby_based_router: NearbyRouterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleRouterConfig {
    /// A subset qualifies when its healthy share of instances reaches this
    /// fraction.
    pub percent_of_min_instances: f64,
    /// With no qualifying subset, serve unhealthy instances too.
    pub enable_recover_all: bool,
}

impl Default for RuleRouterConfig {
    fn default() -> Self {
        Self {
            percent_of_min_instances: 0.0,
            enable_recover_all: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NearbyRouterConfig {
    /// none, region, zone or campus.
    pub match_level: String,
    /// Lowest level the router may degrade to.
    pub max_match_level: String,
    /// Never degrade below the match level.
    pub strict_nearby: bool,
    pub enable_degrade_by_unhealthy_percent: bool,
    /// Percent in (0, 100].
    pub unhealthy_percent_to_degrade: u32,
    pub enable_recover_all: bool,
}

impl Default for NearbyRouterConfig {
    fn default() -> Self {
        Self {
            match_level: "zone".to_string(),
            max_match_level: "none".to_string(),
            strict_nearby: false,
            enable_degrade_by_unhealthy_percent: true,
            unhealthy_percent_to_degrade: 100,
            enable_recover_all: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObservabilityConfig {
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub metrics_enabled: bool,
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// One instance of a static service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticInstanceConfig {
    pub id: String,
    pub host: String,
    pub port: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub dynamic_weight: Option<u32>,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default)]
    pub isolate: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub location: Location,
}

fn default_weight() -> u32 {
    crate::model::instance::DEFAULT_INSTANCE_WEIGHT
}

fn default_healthy() -> bool {
    true
}

impl StaticInstanceConfig {
    pub fn to_instance(&self) -> Instance {
        let mut instance = Instance::new(self.id.clone(), self.host.clone(), self.port)
            .with_weight(self.weight)
            .with_health(self.healthy)
            .with_isolate(self.isolate)
            .with_location(self.location.clone());
        if let Some(weight) = self.dynamic_weight {
            instance = instance.with_dynamic_weight(weight);
        }
        for (key, value) in &self.metadata {
            instance = instance.with_metadata(key.clone(), value.clone());
        }
        instance
    }
}

/// A service declared in the configuration file.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct StaticServiceConfig {
    pub namespace: String,
    pub name: String,
    /// Revision reported for every snapshot of this service.
    pub revision: String,
    pub metadata: BTreeMap<String, String>,
    pub instances: Vec<StaticInstanceConfig>,
    pub route_rule: Option<RouteRuleData>,
    pub circuit_breaker: Option<CircuitBreakerRules>,
}

impl StaticServiceConfig {
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Snapshots this entry publishes: instances always, rules when set.
    pub fn snapshots(&self) -> Vec<ServiceData> {
        let key = self.service_key();
        let revision = if self.revision.is_empty() { "static" } else { self.revision.as_str() };
        let instances = self.instances.iter().map(StaticInstanceConfig::to_instance).collect();
        let mut snapshots = vec![ServiceData::new(
            key.clone(),
            revision,
            ServiceDataContent::Instances(Arc::new(InstancesData::new(instances, self.metadata.clone()))),
        )];
        if let Some(rule) = &self.route_rule {
            snapshots.push(ServiceData::new(key.clone(), revision, ServiceDataContent::RouteRule(rule.clone())));
        }
        if let Some(rules) = &self.circuit_breaker {
            snapshots.push(ServiceData::new(
                key,
                revision,
                ServiceDataContent::CircuitBreakerConfig(rules.clone()),
            ));
        }
        snapshots
    }
}

impl PolarisConfig {
    /// Every snapshot declared under `services`.
    pub fn static_snapshots(&self) -> Vec<ServiceData> {
        self.services.iter().flat_map(StaticServiceConfig::snapshots).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataType;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: PolarisConfig = toml::from_str("").unwrap();
        assert_eq!(config.global.api_timeout, Duration::from_millis(1000));
        assert_eq!(config.consumer.circuit_breaker.chain, vec!["errorCount", "errorRate"]);
        assert_eq!(config.consumer.circuit_breaker.error_count.success_count_after_half_open, 8);
        assert_eq!(config.consumer.service_router.nearby_based_router.match_level, "zone");
        assert_eq!(config.consumer.health_check.when, HealthCheckWhen::Never);
    }

    #[test]
    fn test_camel_case_and_durations() {
        let text = r#"
            [global]
            apiTimeout = "2s"
            [consumer.loadBalancer]
            type = "ringHash"
            vnodeCount = 1000
            [consumer.circuitBreaker]
            checkPeriod = 500
            [consumer.circuitBreaker.errorCount]
            sleepWindow = "5m"
            [consumer.healthCheck]
            when = "onRecover"
        "#;
        let config: PolarisConfig = toml::from_str(text).unwrap();
        assert_eq!(config.global.api_timeout, Duration::from_secs(2));
        assert_eq!(config.consumer.load_balancer.lb_type, "ringHash");
        assert_eq!(config.consumer.load_balancer.vnode_count, Some(1000));
        assert_eq!(config.consumer.circuit_breaker.check_period, Duration::from_millis(500));
        assert_eq!(config.consumer.circuit_breaker.error_count.sleep_window, Duration::from_secs(300));
        assert_eq!(config.consumer.health_check.when, HealthCheckWhen::OnRecover);
    }

    #[test]
    fn test_static_service_snapshots() {
        let text = r#"
            [[services]]
            namespace = "Test"
            name = "echo"
            [[services.instances]]
            id = "i1"
            host = "127.0.0.1"
            port = 8080
            weight = 50
            [services.routeRule]
            inbounds = []
        "#;
        let config: PolarisConfig = toml::from_str(text).unwrap();
        let snapshots = config.static_snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].data_type(), DataType::Instances);
        assert_eq!(snapshots[0].revision, "static");
        let instances = snapshots[0].instances().unwrap();
        assert_eq!(instances.get("i1").unwrap().weight, 50);
        assert_eq!(snapshots[1].data_type(), DataType::RouteRule);
    }
}
