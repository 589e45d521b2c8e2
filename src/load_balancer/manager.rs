//! Load balancer facade.
//!
//! # Responsibilities
//! - Offer half-open instances their trial requests first
//! - Build one selector per (instance set, breaker version) and cache it
//! - Map the selector's answer back to an instance

use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::RefCountedCache;
use crate::config::schema::LoadBalancerConfig;
use crate::error::{PolarisError, PolarisResult};
use crate::hash::{Hash64Fn, HashRegistry};
use crate::load_balancer::ring_hash::{RingOptions, DEFAULT_COMPATIBLE_VNODE_COUNT, DEFAULT_VNODE_COUNT};
use crate::load_balancer::{
    CstHashRing, HashRing, LoadBalanceType, MaglevTable, Selector, SimpleHashSelector, WeightedRandomSelector,
};
use crate::model::{Criteria, Instance, ServiceInstances};
use crate::observability::metrics;
use crate::time::Clock;

/// Identity of a cached selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectorKey {
    pub set_id: u64,
    pub breaker_version: u64,
}

/// One balancing strategy with its selector cache.
pub struct LoadBalancer {
    lb_type: LoadBalanceType,
    hash_func: Hash64Fn,
    ring: RingOptions,
    table_size: u32,
    dynamic_weight: bool,
    cache: Arc<RefCountedCache<SelectorKey, Selector>>,
}

impl LoadBalancer {
    pub fn new(
        lb_type: LoadBalanceType,
        config: &LoadBalancerConfig,
        hashes: &HashRegistry,
        clock: Arc<dyn Clock>,
    ) -> PolarisResult<Self> {
        let hash_func = hashes.get(&config.hash_func)?;
        let default_vnodes = if config.compatible_go {
            DEFAULT_COMPATIBLE_VNODE_COUNT
        } else {
            DEFAULT_VNODE_COUNT
        };
        let ring = RingOptions {
            vnode_count: config.vnode_count.unwrap_or(default_vnodes),
            base_weight: config.base_weight,
            compatible: config.compatible_go,
        };
        if ring.vnode_count == 0 {
            return Err(PolarisError::InvalidConfig("vnodeCount must be positive".into()));
        }
        tracing::debug!(lb_type = %lb_type, hash_func = %config.hash_func, vnode_count = ring.vnode_count, "Load balancer created");
        Ok(Self {
            lb_type,
            hash_func,
            ring,
            table_size: config.table_size,
            dynamic_weight: config.enable_dynamic_weight,
            cache: Arc::new(RefCountedCache::new(lb_type.as_str(), clock)),
        })
    }

    pub fn lb_type(&self) -> LoadBalanceType {
        self.lb_type
    }

    /// The selector cache, for registration with the sweeper.
    pub fn cache(&self) -> Arc<RefCountedCache<SelectorKey, Selector>> {
        self.cache.clone()
    }

    /// Pick one instance from the routed set.
    pub fn choose_instance(&self, service_instances: &ServiceInstances, criteria: &Criteria) -> PolarisResult<Arc<Instance>> {
        let result = self.choose(service_instances, criteria);
        metrics::record_lb_select(self.lb_type.as_str(), result.is_ok());
        result
    }

    fn choose(&self, service_instances: &ServiceInstances, criteria: &Criteria) -> PolarisResult<Arc<Instance>> {
        let set = service_instances.available();
        if set.is_empty() {
            return Err(PolarisError::InstanceNotFound);
        }
        set.record_access();
        let service = service_instances.service();

        if self.lb_type.offers_half_open(criteria) {
            if let Some(instance) = service.try_choose_half_open_instance(set.instances()) {
                tracing::trace!(service = %service.key(), instance = %instance.id, "Half-open instance chosen");
                return Ok(instance);
            }
        }

        let breaker = service.circuit_breaker_data();
        let key = SelectorKey {
            set_id: set.id(),
            breaker_version: breaker.version,
        };
        let selector = self.cache.try_create_or_get(&key, || {
            let half_open: HashSet<String> = breaker
                .half_open_instances
                .keys()
                .filter(|id| set.instances().iter().any(|inst| &inst.id == *id))
                .cloned()
                .collect();
            self.build(set.instances(), &half_open)
        })?;

        let index = selector.select(criteria).ok_or(PolarisError::InstanceNotFound)?;
        set.instances().get(index).cloned().ok_or(PolarisError::InstanceNotFound)
    }

    /// Build the selector, retrying with half-open instances included when
    /// leaving them out empties it.
    fn build(&self, instances: &[Arc<Instance>], half_open: &HashSet<String>) -> PolarisResult<Selector> {
        metrics::record_lb_cache_build(self.lb_type.as_str());
        let selector = self.build_with(instances, half_open)?;
        if !half_open.is_empty() && selector.is_empty() {
            tracing::debug!(lb_type = %self.lb_type, "Selector empty without half-open instances, rebuilding with them");
            return self.build_with(instances, &HashSet::new());
        }
        Ok(selector)
    }

    fn build_with(&self, instances: &[Arc<Instance>], half_open: &HashSet<String>) -> PolarisResult<Selector> {
        Ok(match self.lb_type {
            LoadBalanceType::WeightedRandom => {
                Selector::WeightedRandom(WeightedRandomSelector::setup(instances, half_open, self.dynamic_weight))
            }
            LoadBalanceType::RingHash => Selector::RingHash(HashRing::setup(instances, half_open, self.ring, self.hash_func)),
            LoadBalanceType::Maglev => {
                Selector::Maglev(MaglevTable::setup(instances, half_open, self.table_size, self.hash_func)?)
            }
            LoadBalanceType::L5CstHash => Selector::CstHash(CstHashRing::setup(instances, half_open, false)),
            LoadBalanceType::CMurmurHash => Selector::CstHash(CstHashRing::setup(instances, half_open, true)),
            LoadBalanceType::SimpleHash => Selector::SimpleHash(SimpleHashSelector::setup(instances, half_open)),
        })
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("lb_type", &self.lb_type)
            .field("ring", &self.ring)
            .field("table_size", &self.table_size)
            .field("cached", &self.cache.len())
            .finish()
    }
}
