//! Service keys, snapshots and per-service runtime state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{PolarisError, PolarisResult};
use crate::model::breaker_rule::CircuitBreakerRules;
use crate::model::circuit_breaker::{CircuitBreakerData, UnhealthySetsData};
use crate::model::instance::{Instance, InstancesData, InstancesSet};
use crate::model::route_rule::RouteRuleData;

/// `(namespace, name)` identity of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for ServiceKey {
    type Err = PolarisError;

    /// Parses `namespace/name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(ServiceKey::new(ns, name)),
            _ => Err(PolarisError::InvalidArgument(format!(
                "service key '{}' is not in namespace/name form",
                s
            ))),
        }
    }
}

/// Kind of snapshot held per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Instances,
    RouteRule,
    RateLimit,
    CircuitBreakerConfig,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Instances => "instances",
            DataType::RouteRule => "route_rule",
            DataType::RateLimit => "rate_limit",
            DataType::CircuitBreakerConfig => "circuit_breaker_config",
        }
    }
}

/// Where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    /// Received from the discovery server and kept in sync.
    Syncing,
    /// Restored from a local copy; a fresh one is pending.
    FromDisk,
    /// The server reported the service or data type as absent.
    NotFound,
}

/// Payload of a snapshot.
#[derive(Debug)]
pub enum ServiceDataContent {
    Instances(Arc<InstancesData>),
    RouteRule(RouteRuleData),
    /// Quota rules are handled by another subsystem and kept opaque here.
    RateLimit(serde_json::Value),
    CircuitBreakerConfig(CircuitBreakerRules),
}

impl ServiceDataContent {
    /// Empty payload of the given type, used for not-found snapshots.
    pub fn empty(data_type: DataType) -> Self {
        match data_type {
            DataType::Instances => {
                ServiceDataContent::Instances(Arc::new(InstancesData::new(Vec::new(), Default::default())))
            }
            DataType::RouteRule => ServiceDataContent::RouteRule(RouteRuleData::default()),
            DataType::RateLimit => ServiceDataContent::RateLimit(serde_json::Value::Null),
            DataType::CircuitBreakerConfig => {
                ServiceDataContent::CircuitBreakerConfig(CircuitBreakerRules::default())
            }
        }
    }
}

/// One immutable snapshot for a `(service, data type)` key.
#[derive(Debug)]
pub struct ServiceData {
    pub service_key: ServiceKey,
    pub revision: String,
    pub status: DataStatus,
    pub content: ServiceDataContent,
}

impl ServiceData {
    pub fn new(service_key: ServiceKey, revision: impl Into<String>, content: ServiceDataContent) -> Self {
        Self {
            service_key,
            revision: revision.into(),
            status: DataStatus::Syncing,
            content,
        }
    }

    /// Snapshot recording that the server does not know this key.
    pub fn not_found(service_key: ServiceKey, data_type: DataType) -> Self {
        Self::new(service_key, "", ServiceDataContent::empty(data_type)).with_status(DataStatus::NotFound)
    }

    pub fn with_status(mut self, status: DataStatus) -> Self {
        self.status = status;
        self
    }

    pub fn data_type(&self) -> DataType {
        match self.content {
            ServiceDataContent::Instances(_) => DataType::Instances,
            ServiceDataContent::RouteRule(_) => DataType::RouteRule,
            ServiceDataContent::RateLimit(_) => DataType::RateLimit,
            ServiceDataContent::CircuitBreakerConfig(_) => DataType::CircuitBreakerConfig,
        }
    }

    pub fn instances(&self) -> Option<&Arc<InstancesData>> {
        match &self.content {
            ServiceDataContent::Instances(data) => Some(data),
            _ => None,
        }
    }

    pub fn route_rule(&self) -> Option<&RouteRuleData> {
        match &self.content {
            ServiceDataContent::RouteRule(data) => Some(data),
            _ => None,
        }
    }

    pub fn circuit_breaker_rules(&self) -> Option<&CircuitBreakerRules> {
        match &self.content {
            ServiceDataContent::CircuitBreakerConfig(data) => Some(data),
            _ => None,
        }
    }
}

/// Runtime state of a service that outlives individual snapshots: the
/// published breaker data and the half-open request quota.
#[derive(Debug)]
pub struct Service {
    key: ServiceKey,
    circuit_breaker: ArcSwap<CircuitBreakerData>,
    unhealthy_sets: ArcSwap<UnhealthySetsData>,
    half_open_quota: Mutex<HashMap<String, u32>>,
    has_half_open: AtomicBool,
}

impl Service {
    pub fn new(key: ServiceKey) -> Self {
        Self {
            key,
            circuit_breaker: ArcSwap::from_pointee(CircuitBreakerData::default()),
            unhealthy_sets: ArcSwap::from_pointee(UnhealthySetsData::default()),
            half_open_quota: Mutex::new(HashMap::new()),
            has_half_open: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn circuit_breaker_data(&self) -> Arc<CircuitBreakerData> {
        self.circuit_breaker.load_full()
    }

    pub fn circuit_breaker_version(&self) -> u64 {
        self.circuit_breaker.load().version
    }

    /// Publish newer instance breaker data. Older or equal versions are ignored.
    ///
    /// Instances still half open keep whatever quota they had not used yet.
    pub fn set_circuit_breaker_data(&self, data: CircuitBreakerData) -> bool {
        let mut quota = self.half_open_quota.lock();
        if data.version <= self.circuit_breaker.load().version {
            return false;
        }
        let mut next_quota = data.half_open_instances.clone();
        for (id, remaining) in quota.iter() {
            if let Some(slot) = next_quota.get_mut(id) {
                *slot = *remaining;
            }
        }
        self.has_half_open.store(!next_quota.is_empty(), Ordering::Release);
        *quota = next_quota;
        self.circuit_breaker.store(Arc::new(data));
        true
    }

    pub fn is_half_open(&self, instance_id: &str) -> bool {
        self.circuit_breaker.load().half_open_instances.contains_key(instance_id)
    }

    pub fn is_open(&self, instance_id: &str) -> bool {
        self.circuit_breaker.load().open_instances.contains(instance_id)
    }

    /// Hand out one trial request to a half-open candidate with quota left,
    /// starting from a random position.
    pub fn try_choose_half_open_instance(&self, candidates: &[Arc<Instance>]) -> Option<Arc<Instance>> {
        if !self.has_half_open.load(Ordering::Acquire) || candidates.is_empty() {
            return None;
        }
        let split = fastrand::usize(..candidates.len());
        let mut quota = self.half_open_quota.lock();
        let order = candidates[split..].iter().chain(candidates[..split].iter());
        for instance in order {
            if let Some(remaining) = quota.get_mut(&instance.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Some(instance.clone());
                }
            }
        }
        None
    }

    pub fn unhealthy_sets(&self) -> Arc<UnhealthySetsData> {
        self.unhealthy_sets.load_full()
    }

    pub fn unhealthy_sets_version(&self) -> u64 {
        self.unhealthy_sets.load().version
    }

    /// Publish newer subset breaker data. Older or equal versions are ignored.
    pub fn set_unhealthy_sets(&self, data: UnhealthySetsData) -> bool {
        let current = self.unhealthy_sets.load();
        if data.version <= current.version {
            return false;
        }
        self.unhealthy_sets.store(Arc::new(data));
        true
    }
}

/// Working view of a service for one routing pass.
///
/// Routers narrow `available`; the snapshot and service stay pinned.
#[derive(Debug, Clone)]
pub struct ServiceInstances {
    data: Arc<ServiceData>,
    instances: Arc<InstancesData>,
    service: Arc<Service>,
    available: Arc<InstancesSet>,
}

impl ServiceInstances {
    pub fn new(data: Arc<ServiceData>, service: Arc<Service>) -> PolarisResult<Self> {
        let instances = data
            .instances()
            .cloned()
            .ok_or_else(|| PolarisError::InvalidArgument("snapshot does not hold instances".into()))?;
        Ok(Self {
            available: instances.available().clone(),
            instances,
            data,
            service,
        })
    }

    pub fn data(&self) -> &Arc<ServiceData> {
        &self.data
    }

    pub fn instances_data(&self) -> &InstancesData {
        &self.instances
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn service_key(&self) -> &ServiceKey {
        &self.data.service_key
    }

    pub fn available(&self) -> &Arc<InstancesSet> {
        &self.available
    }

    pub fn set_available(&mut self, set: Arc<InstancesSet>) {
        self.available = set;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn breaker_data(version: u64, half_open: &[(&str, u32)]) -> CircuitBreakerData {
        CircuitBreakerData {
            version,
            open_instances: Default::default(),
            half_open_instances: half_open.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn test_service_key_parse() {
        let key: ServiceKey = "Test/echo".parse().unwrap();
        assert_eq!(key, ServiceKey::new("Test", "echo"));
        assert_eq!(key.to_string(), "Test/echo");
        assert!("echo".parse::<ServiceKey>().is_err());
    }

    #[test]
    fn test_half_open_quota_is_consumed_and_carried() {
        let service = Service::new(ServiceKey::new("Test", "svc"));
        let a = Arc::new(Instance::new("a", "1.1.1.1", 80));
        let b = Arc::new(Instance::new("b", "1.1.1.2", 80));
        let candidates = vec![a.clone(), b.clone()];
        assert!(service.try_choose_half_open_instance(&candidates).is_none());

        assert!(service.set_circuit_breaker_data(breaker_data(1, &[("a", 2)])));
        assert_eq!(service.try_choose_half_open_instance(&candidates).unwrap().id, "a");

        // a new version keeps the remaining quota of a
        assert!(service.set_circuit_breaker_data(breaker_data(2, &[("a", 2), ("b", 1)])));
        let mut picked = Vec::new();
        while let Some(i) = service.try_choose_half_open_instance(&candidates) {
            picked.push(i.id.clone());
        }
        picked.sort();
        assert_eq!(picked, vec!["a".to_string(), "b".to_string()]);

        assert!(!service.set_circuit_breaker_data(breaker_data(2, &[])));
    }

    #[test]
    fn test_service_instances_requires_instances() {
        let key = ServiceKey::new("Test", "svc");
        let data = Arc::new(ServiceData::new(
            key.clone(),
            "r1",
            ServiceDataContent::RouteRule(RouteRuleData::default()),
        ));
        assert!(ServiceInstances::new(data, Arc::new(Service::new(key.clone()))).is_err());

        let data = Arc::new(ServiceData::new(
            key.clone(),
            "r1",
            ServiceDataContent::Instances(Arc::new(InstancesData::new(
                vec![Instance::new("a", "1.1.1.1", 80)],
                BTreeMap::new(),
            ))),
        ));
        let si = ServiceInstances::new(data, Arc::new(Service::new(key))).unwrap();
        assert_eq!(si.available().len(), 1);
    }
}
