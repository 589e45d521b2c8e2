//! Configured sequence of routers.
//!
//! When no router narrowed the set (no route rule applied, nearby routing
//! off or disabled for the request), the chain still drops unhealthy and
//! breaker-open instances, unless that would leave nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{RefCountedCache, Sweepable};
use crate::config::schema::ServiceRouterConfig;
use crate::error::PolarisResult;
use crate::model::InstancesSet;
use crate::routing::nearby_router::{ClientLocation, NearbyRouter};
use crate::routing::route_info::{RouteInfo, RouteResult};
use crate::routing::rule_router::{RuleRouteOutcome, RuleRouter};
use crate::routing::RouterKind;
use crate::time::Clock;

#[derive(Debug)]
enum Router {
    Rule(RuleRouter),
    Nearby(NearbyRouter),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HealthyCacheKey {
    prior_set_id: u64,
    circuit_breaker_version: u64,
    request_flags: u8,
}

#[derive(Debug)]
pub struct RouterChain {
    routers: Vec<Router>,
    healthy: Arc<RefCountedCache<HealthyCacheKey, InstancesSet>>,
}

impl RouterChain {
    /// Fails on an unknown router name or an unusable nearby setup.
    pub fn new(config: &ServiceRouterConfig, location: Arc<ClientLocation>, clock: Arc<dyn Clock>) -> PolarisResult<Self> {
        let mut routers = Vec::with_capacity(config.chain.len());
        for name in &config.chain {
            let router = match name.parse::<RouterKind>()? {
                RouterKind::RuleBased => Router::Rule(RuleRouter::new(config.rule_based_router.clone(), clock.clone())),
                RouterKind::NearbyBased => {
                    Router::Nearby(NearbyRouter::new(&config.nearby_based_router, location.clone(), clock.clone())?)
                }
            };
            routers.push(router);
        }
        tracing::debug!(chain = ?config.chain, "Router chain created");
        Ok(Self {
            routers,
            healthy: Arc::new(RefCountedCache::new("healthy_filter", clock)),
        })
    }

    pub fn kinds(&self) -> Vec<RouterKind> {
        self.routers
            .iter()
            .map(|r| match r {
                Router::Rule(_) => RouterKind::RuleBased,
                Router::Nearby(_) => RouterKind::NearbyBased,
            })
            .collect()
    }

    /// Router caches, for the background sweeper.
    pub fn caches(&self) -> Vec<Arc<dyn Sweepable>> {
        let mut caches: Vec<Arc<dyn Sweepable>> = self
            .routers
            .iter()
            .map(|r| -> Arc<dyn Sweepable> {
                match r {
                    Router::Rule(router) => router.cache(),
                    Router::Nearby(router) => router.cache(),
                }
            })
            .collect();
        caches.push(self.healthy.clone());
        caches
    }

    /// Run every router in order. A redirect ends the chain early.
    pub fn route(&self, mut info: RouteInfo) -> PolarisResult<RouteResult> {
        let mut subset = BTreeMap::new();
        let mut narrowed = false;
        for router in &self.routers {
            match router {
                Router::Rule(router) => match router.route(&info)? {
                    RuleRouteOutcome::Unchanged => {}
                    RuleRouteOutcome::Subset(set) => {
                        subset = set.subset().clone();
                        info.service_instances.set_available(set);
                        narrowed = true;
                    }
                    RuleRouteOutcome::Redirect(target) => {
                        tracing::debug!(service = %info.service_key(), target = %target, "Routing redirected");
                        return Ok(RouteResult::Redirect(target));
                    }
                },
                Router::Nearby(router) => {
                    narrowed |= !info.disable_nearby;
                    router.route(&mut info)?
                }
            }
        }
        if !narrowed {
            self.filter_unhealthy(&mut info);
        }
        Ok(RouteResult::Instances {
            service_instances: info.service_instances,
            subset,
        })
    }

    fn filter_unhealthy(&self, info: &mut RouteInfo) {
        let prior = info.service_instances.available().clone();
        let unhealthy = info.unhealthy_set();
        let dropped = prior.instances().iter().filter(|i| unhealthy.contains(&i.id)).count();
        if dropped == 0 || dropped == prior.len() {
            return;
        }
        let key = HealthyCacheKey {
            prior_set_id: prior.id(),
            circuit_breaker_version: info.service_instances.service().circuit_breaker_version(),
            request_flags: info.request_flags(),
        };
        let healthy = self.healthy.create_or_get(&key, || {
            tracing::trace!(service = %info.service_key(), dropped, "Unhealthy instances filtered");
            let instances = prior
                .instances()
                .iter()
                .filter(|i| !unhealthy.contains(&i.id))
                .cloned()
                .collect();
            InstancesSet::with_subset(instances, prior.subset().clone(), prior.recover_info())
        });
        info.service_instances.set_available(healthy);
    }
}
