//! Input and output of one routing pass.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::model::route_rule::SourceService;
use crate::model::{ServiceData, ServiceInstances, ServiceKey};

/// Everything the router chain reads for one request.
///
/// `service_instances.available()` is narrowed by each router in turn.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub service_instances: ServiceInstances,
    /// Route rule snapshot of the callee.
    pub route_rule: Option<Arc<ServiceData>>,
    pub source: Option<SourceService>,
    /// Route rule snapshot of the caller, for its outbound rules.
    pub source_route_rule: Option<Arc<ServiceData>>,
    /// Caller labels, e.g. the method; keys the set breaker status.
    pub labels: BTreeMap<String, String>,
    pub include_unhealthy: bool,
    pub include_circuit_breaker: bool,
    pub disable_nearby: bool,
}

impl RouteInfo {
    pub fn new(service_instances: ServiceInstances) -> Self {
        Self {
            service_instances,
            route_rule: None,
            source: None,
            source_route_rule: None,
            labels: BTreeMap::new(),
            include_unhealthy: false,
            include_circuit_breaker: false,
            disable_nearby: false,
        }
    }

    pub fn service_key(&self) -> &ServiceKey {
        self.service_instances.service_key()
    }

    /// Bit flags of the request options that change the routing result.
    pub fn request_flags(&self) -> u8 {
        (self.include_unhealthy as u8) | (self.include_circuit_breaker as u8) << 1
    }

    /// Ids the routers treat as unhealthy: instances flagged unhealthy and
    /// instances whose breaker is open, unless the request includes them.
    pub fn unhealthy_set(&self) -> HashSet<String> {
        let mut unhealthy = HashSet::new();
        if !self.include_unhealthy {
            unhealthy.extend(
                self.service_instances
                    .instances_data()
                    .all()
                    .instances()
                    .iter()
                    .filter(|i| !i.healthy)
                    .map(|i| i.id.clone()),
            );
        }
        if !self.include_circuit_breaker {
            let data = self.service_instances.instances_data();
            let breaker = self.service_instances.service().circuit_breaker_data();
            unhealthy.extend(breaker.open_instances.iter().filter(|id| data.contains(id)).cloned());
        }
        unhealthy
    }
}

/// What the router chain produced.
#[derive(Debug, Clone)]
pub enum RouteResult {
    /// The narrowed instances, with the subset chosen by the rule router.
    Instances {
        service_instances: ServiceInstances,
        subset: BTreeMap<String, String>,
    },
    /// The rule asks to call another service instead.
    Redirect(ServiceKey),
}

impl RouteResult {
    pub fn is_redirect(&self) -> bool {
        matches!(self, RouteResult::Redirect(_))
    }
}
