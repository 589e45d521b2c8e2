//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Resolve names: balancer type, hash function, breaker and router chains
//! - Validate value ranges (Maglev table prime, check period, percentages)
//! - Check static services for duplicate keys and instance ids
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: PolarisConfig → Result<(), Vec<ValidationError>>
//! - Breaker thresholds are mostly not checked here; out-of-range values
//!   fall back to defaults when the breakers are built. The one exception is
//!   an explicit half-open error count, which must fit the trial requests

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::circuit_breaker::InstanceBreakerKind;
use crate::config::schema::PolarisConfig;
use crate::hash::HashRegistry;
use crate::load_balancer::maglev::is_prime;
use crate::load_balancer::LoadBalanceType;
use crate::routing::nearby_router::MatchLevel;
use crate::routing::RouterKind;

pub const MIN_CHECK_PERIOD: Duration = Duration::from_millis(100);

/// One semantic problem, located by its option path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &PolarisConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    validate_load_balancer(config, &mut errors);
    validate_circuit_breaker(config, &mut errors);
    validate_router(config, &mut errors);
    validate_services(config, &mut errors);

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metricsAddress",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }
    if config.consumer.health_check.interval.is_zero() {
        errors.push(ValidationError::new("consumer.healthCheck.interval", "must be positive"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_load_balancer(config: &PolarisConfig, errors: &mut Vec<ValidationError>) {
    let lb = &config.consumer.load_balancer;
    if lb.lb_type.parse::<LoadBalanceType>().is_err() {
        errors.push(ValidationError::new(
            "consumer.loadBalancer.type",
            format!("unknown load balancer '{}'", lb.lb_type),
        ));
    }
    if !HashRegistry::new().contains(&lb.hash_func) {
        errors.push(ValidationError::new(
            "consumer.loadBalancer.hashFunc",
            format!("unknown hash function '{}'", lb.hash_func),
        ));
    }
    if lb.vnode_count == Some(0) {
        errors.push(ValidationError::new("consumer.loadBalancer.vnodeCount", "must be positive"));
    }
    if !is_prime(lb.table_size) {
        errors.push(ValidationError::new(
            "consumer.loadBalancer.tableSize",
            format!("{} is not prime", lb.table_size),
        ));
    }
}

fn validate_circuit_breaker(config: &PolarisConfig, errors: &mut Vec<ValidationError>) {
    let cb = &config.consumer.circuit_breaker;
    if cb.check_period < MIN_CHECK_PERIOD {
        errors.push(ValidationError::new(
            "consumer.circuitBreaker.checkPeriod",
            format!("must be at least {}ms", MIN_CHECK_PERIOD.as_millis()),
        ));
    }
    let mut seen = HashSet::new();
    for name in &cb.chain {
        if name.parse::<InstanceBreakerKind>().is_err() {
            errors.push(ValidationError::new(
                "consumer.circuitBreaker.chain",
                format!("unknown circuit breaker '{}'", name),
            ));
        } else if !seen.insert(name.as_str()) {
            errors.push(ValidationError::new(
                "consumer.circuitBreaker.chain",
                format!("'{}' listed twice", name),
            ));
        }
    }
    let count = &cb.error_count;
    if let Some(errors_after) = count.error_count_after_half_open {
        if errors_after == 0 {
            errors.push(ValidationError::new(
                "consumer.circuitBreaker.errorCount.errorCountAfterHalfOpen",
                "must be positive",
            ));
        } else if count.request_count_after_half_open > 0
            && i64::from(errors_after) > count.request_count_after_half_open
        {
            errors.push(ValidationError::new(
                "consumer.circuitBreaker.errorCount.errorCountAfterHalfOpen",
                format!(
                    "{} exceeds requestCountAfterHalfOpen {}",
                    errors_after, count.request_count_after_half_open
                ),
            ));
        }
    }
}

fn validate_router(config: &PolarisConfig, errors: &mut Vec<ValidationError>) {
    let router = &config.consumer.service_router;
    for name in &router.chain {
        if name.parse::<RouterKind>().is_err() {
            errors.push(ValidationError::new(
                "consumer.serviceRouter.chain",
                format!("unknown router '{}'", name),
            ));
        }
    }

    let rule = &router.rule_based_router;
    if !(0.0..=1.0).contains(&rule.percent_of_min_instances) {
        errors.push(ValidationError::new(
            "consumer.serviceRouter.ruleBasedRouter.percentOfMinInstances",
            "must be within [0, 1]",
        ));
    }

    let nearby = &router.nearby_based_router;
    let match_level = nearby.match_level.parse::<MatchLevel>();
    let max_level = nearby.max_match_level.parse::<MatchLevel>();
    if match_level.is_err() {
        errors.push(ValidationError::new(
            "consumer.serviceRouter.nearbyBasedRouter.matchLevel",
            format!("unknown level '{}'", nearby.match_level),
        ));
    }
    if max_level.is_err() {
        errors.push(ValidationError::new(
            "consumer.serviceRouter.nearbyBasedRouter.maxMatchLevel",
            format!("unknown level '{}'", nearby.max_match_level),
        ));
    }
    if let (Ok(match_level), Ok(max_level)) = (match_level, max_level) {
        if match_level < max_level {
            errors.push(ValidationError::new(
                "consumer.serviceRouter.nearbyBasedRouter.maxMatchLevel",
                format!("'{}' is narrower than matchLevel '{}'", max_level, match_level),
            ));
        }
    }
    if nearby.unhealthy_percent_to_degrade == 0 || nearby.unhealthy_percent_to_degrade > 100 {
        errors.push(ValidationError::new(
            "consumer.serviceRouter.nearbyBasedRouter.unhealthyPercentToDegrade",
            "must be within (0, 100]",
        ));
    }
}

fn validate_services(config: &PolarisConfig, errors: &mut Vec<ValidationError>) {
    let mut keys = HashSet::new();
    for service in &config.services {
        if service.namespace.is_empty() || service.name.is_empty() {
            errors.push(ValidationError::new("services", "namespace and name are required"));
            continue;
        }
        let key = service.service_key();
        if !keys.insert(key.clone()) {
            errors.push(ValidationError::new("services", format!("service {} declared twice", key)));
        }
        let mut ids = HashSet::new();
        for instance in &service.instances {
            if !ids.insert(instance.id.as_str()) {
                errors.push(ValidationError::new(
                    "services.instances",
                    format!("instance id '{}' repeated in {}", instance.id, key),
                ));
            }
        }
    }
}
