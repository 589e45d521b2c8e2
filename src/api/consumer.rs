//! Consumer calls: discover, route, balance and report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::api::context::Context;
use crate::error::{PolarisError, PolarisResult};
use crate::load_balancer::LoadBalanceType;
use crate::model::route_rule::SourceService;
use crate::model::{CallResult, CircuitBreakerStatus, Criteria, DataType, Instance, ServiceData, ServiceInstances, ServiceKey};
use crate::routing::{RouteInfo, RouteResult};

/// Hops a chain of transfer rules may take before the call fails.
const MAX_REDIRECTS: usize = 4;

/// One discovery request.
#[derive(Debug, Clone, Default)]
pub struct InstanceRequest {
    pub service_key: ServiceKey,
    pub criteria: Criteria,
    pub source: Option<SourceService>,
    pub labels: BTreeMap<String, String>,
    /// Wait for service data; the global api timeout when unset.
    pub timeout: Option<Duration>,
    pub load_balance_type: Option<LoadBalanceType>,
    pub include_unhealthy: bool,
    pub include_circuit_breaker: bool,
    pub disable_nearby: bool,
}

impl InstanceRequest {
    pub fn new(service_key: ServiceKey) -> Self {
        Self {
            service_key,
            ..Default::default()
        }
    }

    pub fn with_criteria(mut self, criteria: Criteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_source(mut self, source: SourceService) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_load_balance_type(mut self, lb_type: LoadBalanceType) -> Self {
        self.load_balance_type = Some(lb_type);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Routed instances of a service.
#[derive(Debug, Clone)]
pub struct InstancesResponse {
    /// The service finally routed to, after any redirect.
    pub service_key: ServiceKey,
    pub revision: String,
    pub subset: BTreeMap<String, String>,
    pub instances: Vec<Arc<Instance>>,
}

#[derive(Debug, Clone)]
pub struct ConsumerApi {
    context: Arc<Context>,
}

impl ConsumerApi {
    pub fn new(context: Arc<Context>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Route the request, then let the balancer pick one instance.
    pub fn get_one_instance(&self, request: &InstanceRequest) -> PolarisResult<Arc<Instance>> {
        let (service_instances, _) = self.route(request)?;
        let balancer = self.context.balancer(request.load_balance_type)?;
        let instance = balancer.choose_instance(&service_instances, &request.criteria)?;
        tracing::trace!(service = %service_instances.service_key(), instance = %instance.id, "Instance chosen");
        Ok(instance)
    }

    /// Every instance left after routing.
    pub fn get_instances(&self, request: &InstanceRequest) -> PolarisResult<InstancesResponse> {
        let (service_instances, subset) = self.route(request)?;
        Ok(InstancesResponse {
            service_key: service_instances.service_key().clone(),
            revision: service_instances.data().revision.clone(),
            subset,
            instances: service_instances.available().instances().to_vec(),
        })
    }

    pub fn update_call_result(&self, result: &CallResult) -> PolarisResult<()> {
        self.context.executor().update_call_result(result)
    }

    pub fn get_circuit_breaker_status(&self, service_key: &ServiceKey, instance_id: &str) -> CircuitBreakerStatus {
        self.context.executor().status(service_key, instance_id)
    }

    fn route(&self, request: &InstanceRequest) -> PolarisResult<(ServiceInstances, BTreeMap<String, String>)> {
        if request.service_key.namespace.is_empty() || request.service_key.name.is_empty() {
            return Err(PolarisError::InvalidArgument("service namespace and name are required".into()));
        }
        let timeout = request.timeout.unwrap_or(self.context.config().global.api_timeout);
        let registry = self.context.registry();
        let source_rule = match request.source.as_ref().and_then(|s| s.service_key.as_ref()) {
            Some(source_key) => self.optional(registry.wait_for(source_key, DataType::RouteRule, timeout))?,
            None => None,
        };

        let mut service_key = request.service_key.clone();
        for _ in 0..=MAX_REDIRECTS {
            let data = registry.wait_for(&service_key, DataType::Instances, timeout)?;
            let service = registry.get_or_create_service(&service_key);
            let mut info = RouteInfo::new(ServiceInstances::new(data, service)?);
            info.route_rule = self.optional(registry.wait_for(&service_key, DataType::RouteRule, timeout))?;
            info.source = request.source.clone();
            info.source_route_rule = source_rule.clone();
            info.labels = request.labels.clone();
            info.include_unhealthy = request.include_unhealthy;
            info.include_circuit_breaker = request.include_circuit_breaker;
            info.disable_nearby = request.disable_nearby;

            match self.context.router().route(info)? {
                RouteResult::Instances { service_instances, subset } => return Ok((service_instances, subset)),
                RouteResult::Redirect(target) => {
                    tracing::debug!(from = %service_key, to = %target, "Following route redirect");
                    service_key = target;
                }
            }
        }
        Err(PolarisError::InvalidArgument(format!(
            "route of {} redirects more than {} times",
            request.service_key, MAX_REDIRECTS
        )))
    }

    /// Missing optional data is not an error.
    fn optional(&self, result: PolarisResult<Arc<ServiceData>>) -> PolarisResult<Option<Arc<ServiceData>>> {
        match result {
            Ok(data) => Ok(Some(data)),
            Err(PolarisError::ResourceNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
