//! Rule based routing.
//!
//! # Responsibilities
//! - Match the caller against the callee's inbound rules, else the caller's
//!   outbound rules
//! - Group instances into subsets by destination metadata, per priority
//! - Apply subset breaker status, recover-all and the minimum healthy share
//! - Pick one subset by weight; cache the weighted subsets per input

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::cache::RefCountedCache;
use crate::config::schema::RuleRouterConfig;
use crate::error::{PolarisError, PolarisResult};
use crate::model::circuit_breaker::{map_to_key, SetUnhealthyInfo};
use crate::model::match_string::map_match_with_parameters;
use crate::model::route_rule::{Destination, Route};
use crate::model::{CircuitBreakerStatus, Instance, InstancesSet, ServiceKey};
use crate::observability::metrics;
use crate::routing::route_info::RouteInfo;
use crate::time::Clock;

pub const ROUTER_NAME: &str = "ruleBasedRouter";
/// Weight given to every subset when no destination sets one.
const DEFAULT_SUBSET_WEIGHT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleCacheKey {
    prior_set_id: u64,
    rule_revision: String,
    match_outbounds: bool,
    route_index: usize,
    request_flags: u8,
    circuit_breaker_version: u64,
    set_circuit_breaker_version: u64,
    labels: String,
    parameters: String,
}

/// Weighted subsets, or the service to redirect to.
#[derive(Debug)]
pub enum RuleCacheValue {
    Subsets {
        /// `(cumulative weight, subset)` in ascending order.
        subsets: Vec<(u32, Arc<InstancesSet>)>,
        sum_weight: u32,
    },
    Redirect(ServiceKey),
}

/// Outcome of one rule routing pass.
#[derive(Debug, Clone)]
pub enum RuleRouteOutcome {
    /// No rule applies; instances untouched.
    Unchanged,
    Subset(Arc<InstancesSet>),
    Redirect(ServiceKey),
}

/// Instances of one subset of one destination.
#[derive(Debug, Clone)]
struct RouterSet {
    subset: BTreeMap<String, String>,
    healthy: Vec<Arc<Instance>>,
    unhealthy: Vec<Arc<Instance>>,
    weight: u32,
    isolated: bool,
}

impl RouterSet {
    fn size(&self) -> usize {
        self.healthy.len() + self.unhealthy.len()
    }
}

/// Priority → subsets, lower priority value first.
type PriorityGroups = Vec<(u32, Vec<RouterSet>)>;

pub struct RuleRouter {
    config: RuleRouterConfig,
    cache: Arc<RefCountedCache<RuleCacheKey, RuleCacheValue>>,
    not_match_count: AtomicU64,
}

impl RuleRouter {
    pub fn new(config: RuleRouterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            cache: Arc::new(RefCountedCache::new("rule_router", clock)),
            not_match_count: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> Arc<RefCountedCache<RuleCacheKey, RuleCacheValue>> {
        self.cache.clone()
    }

    /// Rule mismatches since the last call.
    pub fn take_not_match_count(&self) -> u64 {
        self.not_match_count.swap(0, Ordering::Relaxed)
    }

    fn not_match(&self) -> PolarisError {
        self.not_match_count.fetch_add(1, Ordering::Relaxed);
        PolarisError::RouteRuleNotMatch
    }

    pub fn route(&self, info: &RouteInfo) -> PolarisResult<RuleRouteOutcome> {
        let mut parameters = String::new();
        let Some((route, match_outbounds, route_index, rule_revision)) = self.match_route(info, &mut parameters)? else {
            return Ok(RuleRouteOutcome::Unchanged);
        };

        let service = info.service_instances.service();
        let labels_key = map_to_key(&info.labels);
        let prior = info.service_instances.available().clone();
        let key = RuleCacheKey {
            prior_set_id: prior.id(),
            rule_revision,
            match_outbounds,
            route_index,
            request_flags: info.request_flags(),
            circuit_breaker_version: service.circuit_breaker_version(),
            set_circuit_breaker_version: service.unhealthy_sets_version(),
            labels: labels_key.clone(),
            parameters,
        };

        let value = self.cache.try_create_or_get(&key, || {
            self.build(info, &route, match_outbounds, &prior, &labels_key)
        })?;
        match value.as_ref() {
            RuleCacheValue::Redirect(target) => Ok(RuleRouteOutcome::Redirect(target.clone())),
            RuleCacheValue::Subsets { subsets, sum_weight } => {
                let chosen = select_subset(subsets, *sum_weight).ok_or_else(|| self.not_match())?;
                chosen.record_access();
                Ok(RuleRouteOutcome::Subset(chosen))
            }
        }
    }

    /// Matched route, whether it is an outbound rule of the caller, its
    /// index and the revision of the rule snapshot it came from.
    ///
    /// `Ok(None)` when neither side has rules.
    fn match_route(&self, info: &RouteInfo, parameters: &mut String) -> PolarisResult<Option<(Route, bool, usize, String)>> {
        if let Some(snapshot) = &info.route_rule {
            if let Some(rule) = snapshot.route_rule() {
                for (index, route) in rule.inbounds.iter().enumerate() {
                    if route.match_source(info.source.as_ref(), parameters) {
                        return Ok(Some((route.clone(), false, index, snapshot.revision.clone())));
                    }
                }
                if !rule.inbounds.is_empty() {
                    return Err(self.not_match());
                }
            }
        }
        if let Some(snapshot) = &info.source_route_rule {
            if let Some(rule) = snapshot.route_rule() {
                for (index, route) in rule.outbounds.iter().enumerate() {
                    if route.match_source(info.source.as_ref(), parameters) {
                        return Ok(Some((route.clone(), true, index, snapshot.revision.clone())));
                    }
                }
                if !rule.outbounds.is_empty() {
                    return Err(self.not_match());
                }
            }
        }
        Ok(None)
    }

    fn build(
        &self,
        info: &RouteInfo,
        route: &Route,
        match_outbounds: bool,
        prior: &InstancesSet,
        labels_key: &str,
    ) -> PolarisResult<RuleCacheValue> {
        let service_key = info.service_key();
        let unhealthy = info.unhealthy_set();
        let empty = BTreeMap::new();
        let parameters = info.source.as_ref().map(|s| &s.metadata).unwrap_or(&empty);

        let mut groups: PriorityGroups = Vec::new();
        for (priority, destinations) in route.destinations_by_priority() {
            let mut sets = Vec::new();
            for destination in destinations {
                if match_outbounds && !destination.matches_service(service_key) {
                    continue;
                }
                if let Some(transfer) = &destination.transfer {
                    let target = ServiceKey::new(service_key.namespace.clone(), transfer.clone());
                    tracing::debug!(service = %service_key, target = %target, "Route rule redirects");
                    return Ok(RuleCacheValue::Redirect(target));
                }
                sets.extend(group_by_subset(destination, prior.instances(), &unhealthy, parameters));
            }
            if !sets.is_empty() {
                groups.push((priority, sets));
            }
        }

        let breaker_sets = info.service_instances.service().unhealthy_sets();
        apply_set_breaker(&mut groups, &breaker_sets.infos, labels_key);
        let (chosen, sum_weight, recover_all) =
            pick_priority_group(groups, self.config.percent_of_min_instances, self.config.enable_recover_all);
        if chosen.is_empty() {
            tracing::debug!(service = %service_key, "No subset left after rule routing");
            return Err(self.not_match());
        }

        let mut subsets = Vec::with_capacity(chosen.len());
        let mut cumulative = 0u32;
        let mut selected = Vec::new();
        for mut set in chosen {
            if sum_weight == 0 {
                set.weight = DEFAULT_SUBSET_WEIGHT;
            } else if set.weight == 0 {
                continue;
            }
            cumulative += set.weight;
            selected.push(map_to_key(&set.subset));
            let recover_info = if recover_all { "recover all" } else { "" };
            subsets.push((cumulative, Arc::new(InstancesSet::with_subset(set.healthy, set.subset, recover_info))));
        }

        if prior.update_recover_all(recover_all) {
            tracing::info!(service = %service_key, subsets = %selected.join(","), recover_all, "Rule router recover-all changed");
            if recover_all {
                metrics::record_recover_all(ROUTER_NAME);
            }
        }
        tracing::trace!(service = %service_key, subsets = subsets.len(), "Rule route computed");
        Ok(RuleCacheValue::Subsets {
            subsets,
            sum_weight: cumulative,
        })
    }
}

impl std::fmt::Debug for RuleRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRouter")
            .field("config", &self.config)
            .field("cache_entries", &self.cache.len())
            .finish()
    }
}

/// Split the instances a destination selects into subsets keyed by the
/// values of the destination's metadata keys.
fn group_by_subset(
    destination: &Destination,
    instances: &[Arc<Instance>],
    unhealthy: &HashSet<String>,
    parameters: &BTreeMap<String, String>,
) -> Vec<RouterSet> {
    let mut sets: BTreeMap<String, RouterSet> = BTreeMap::new();
    for instance in instances {
        if !map_match_with_parameters(&destination.metadata, &instance.metadata, parameters) {
            continue;
        }
        let subset: BTreeMap<String, String> = destination
            .metadata
            .iter()
            .map(|(key, matcher)| {
                let value = if matcher.is_parameter() {
                    parameters.get(key)
                } else {
                    instance.metadata.get(key)
                };
                (key.clone(), value.cloned().unwrap_or_default())
            })
            .collect();
        let set = sets.entry(map_to_key(&subset)).or_insert_with(|| RouterSet {
            subset,
            healthy: Vec::new(),
            unhealthy: Vec::new(),
            weight: destination.weight,
            isolated: destination.isolate,
        });
        if unhealthy.contains(&instance.id) {
            set.unhealthy.push(instance.clone());
        } else {
            set.healthy.push(instance.clone());
        }
    }
    sets.into_values().collect()
}

/// Breaker status of a subset: the whole-subset key wins over the
/// `subset#labels` key.
fn set_breaker_info<'a>(
    infos: &'a HashMap<String, SetUnhealthyInfo>,
    subset: &BTreeMap<String, String>,
    labels_key: &str,
) -> Option<&'a SetUnhealthyInfo> {
    let subset_key = map_to_key(subset);
    infos
        .get(&format!("{}#", subset_key))
        .or_else(|| infos.get(&format!("{}#{}", subset_key, labels_key)))
}

fn set_status(
    infos: &HashMap<String, SetUnhealthyInfo>,
    set: &RouterSet,
    labels_key: &str,
) -> CircuitBreakerStatus {
    set_breaker_info(infos, &set.subset, labels_key)
        .map(|i| i.status)
        .unwrap_or_default()
}

/// Take the first healthy, non-isolated subset of a lower priority to share
/// a half-open subset's traffic.
fn take_downgrade_subset(
    lower: &mut [(u32, Vec<RouterSet>)],
    infos: &HashMap<String, SetUnhealthyInfo>,
    labels_key: &str,
) -> Option<RouterSet> {
    for (_, sets) in lower.iter_mut() {
        let found = sets
            .iter()
            .position(|s| !s.isolated && set_status(infos, s, labels_key) == CircuitBreakerStatus::Close);
        if let Some(index) = found {
            return Some(sets.remove(index));
        }
    }
    None
}

/// Narrow the priority groups by subset breaker status.
///
/// The top priority keeps its Close / Preserved subsets; a half-open subset
/// keeps its release share and hands the rest to a healthy downgrade subset.
/// When the top priority has neither, the first lower priority with healthy
/// subsets replaces it; failing that the top priority stays as is.
fn apply_set_breaker(
    groups: &mut PriorityGroups,
    infos: &HashMap<String, SetUnhealthyInfo>,
    labels_key: &str,
) {
    let Some(((_, top), lower)) = groups.split_first_mut() else {
        return;
    };

    let mut healthy = Vec::new();
    let mut half_open = Vec::new();
    let mut open = Vec::new();
    for set in top.drain(..) {
        if set.isolated {
            continue;
        }
        match set_status(infos, &set, labels_key) {
            CircuitBreakerStatus::Close | CircuitBreakerStatus::Preserved => healthy.push(set),
            CircuitBreakerStatus::HalfOpen => half_open.push(set),
            CircuitBreakerStatus::Open => open.push(set),
        }
    }

    if !healthy.is_empty() || !half_open.is_empty() {
        for mut set in half_open {
            match take_downgrade_subset(lower, infos, labels_key) {
                Some(mut downgrade) => {
                    let pass_rate = set_breaker_info(infos, &set.subset, labels_key)
                        .map(|i| i.half_open_release_percent.clamp(0.0, 1.0))
                        .unwrap_or(1.0);
                    set.weight = (set.weight as f32 * pass_rate) as u32;
                    downgrade.weight = (downgrade.weight as f32 * (1.0 - pass_rate)) as u32;
                    healthy.push(set);
                    healthy.push(downgrade);
                }
                None => healthy.push(set),
            }
        }
        *top = healthy;
        return;
    }
    *top = open;

    let replacement = groups.iter().skip(1).position(|(_, sets)| {
        sets.iter()
            .any(|s| !s.isolated && set_status(infos, s, labels_key) == CircuitBreakerStatus::Close)
    });
    if let Some(offset) = replacement {
        let (priority, sets) = groups.swap_remove(offset + 1);
        let sets: Vec<RouterSet> = sets
            .into_iter()
            .filter(|s| !s.isolated && set_status(infos, s, labels_key) == CircuitBreakerStatus::Close)
            .collect();
        *groups = vec![(priority, sets)];
    }
}

/// Subsets of the top priority with enough healthy instances. With
/// recover-all, a second pass counts unhealthy instances as healthy.
///
/// Returns the subsets, their total weight and whether recover-all kicked in.
fn pick_priority_group(
    groups: PriorityGroups,
    percent_of_min_instances: f64,
    enable_recover_all: bool,
) -> (Vec<RouterSet>, u32, bool) {
    let Some((_, mut top)) = groups.into_iter().next() else {
        return (Vec::new(), 0, false);
    };
    let mut recover_all = false;
    loop {
        let mut chosen = Vec::new();
        let mut sum_weight = 0;
        for set in &mut top {
            let size = set.size();
            if recover_all {
                let unhealthy = std::mem::take(&mut set.unhealthy);
                set.healthy.extend(unhealthy);
            }
            if !set.healthy.is_empty() && set.healthy.len() as f64 >= percent_of_min_instances * size as f64 {
                chosen.push(set.clone());
                sum_weight += set.weight;
            }
        }
        if !chosen.is_empty() || recover_all || !enable_recover_all {
            return (chosen, sum_weight, recover_all);
        }
        recover_all = true;
    }
}

/// Weighted pick over cumulative weights.
fn select_subset(subsets: &[(u32, Arc<InstancesSet>)], sum_weight: u32) -> Option<Arc<InstancesSet>> {
    if sum_weight == 0 {
        return None;
    }
    let point = rand::thread_rng().gen_range(0..sum_weight);
    let index = subsets.partition_point(|(cumulative, _)| *cumulative <= point);
    subsets.get(index).map(|(_, set)| set.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::match_string::MatchString;
    use crate::model::route_rule::{RouteRuleData, Source};
    use crate::model::circuit_breaker::UnhealthySetsData;
    use crate::model::{InstancesData, Service, ServiceData, ServiceDataContent, ServiceInstances};
    use crate::time::ManualClock;

    fn key() -> ServiceKey {
        ServiceKey::new("Test", "callee")
    }

    fn instance(id: &str, version: &str, healthy: bool) -> Instance {
        Instance::new(id, "10.0.0.1", 8000)
            .with_metadata("version", version)
            .with_health(healthy)
    }

    fn destination(version: &str, priority: u32, weight: u32) -> Destination {
        let mut metadata = BTreeMap::new();
        metadata.insert("version".to_string(), MatchString::exact(version));
        Destination {
            namespace: "*".into(),
            service: "*".into(),
            metadata,
            priority,
            weight,
            isolate: false,
            transfer: None,
        }
    }

    fn route_info(instances: Vec<Instance>, destinations: Vec<Destination>) -> RouteInfo {
        let data = Arc::new(ServiceData::new(
            key(),
            "i1",
            ServiceDataContent::Instances(Arc::new(InstancesData::new(instances, BTreeMap::new()))),
        ));
        let service = Arc::new(Service::new(key()));
        let mut info = RouteInfo::new(ServiceInstances::new(data, service).unwrap());
        let rule = RouteRuleData {
            inbounds: vec![Route {
                sources: vec![],
                destinations,
            }],
            outbounds: vec![],
        };
        info.route_rule = Some(Arc::new(ServiceData::new(key(), "r1", ServiceDataContent::RouteRule(rule))));
        info
    }

    fn router(config: RuleRouterConfig) -> RuleRouter {
        RuleRouter::new(config, Arc::new(ManualClock::new(0)))
    }

    fn chosen_ids(outcome: RuleRouteOutcome) -> Vec<String> {
        match outcome {
            RuleRouteOutcome::Subset(set) => {
                let mut ids: Vec<String> = set.instances().iter().map(|i| i.id.clone()).collect();
                ids.sort();
                ids
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_no_rule_leaves_instances() {
        let mut info = route_info(vec![instance("a", "v1", true)], vec![]);
        info.route_rule = None;
        let outcome = router(RuleRouterConfig::default()).route(&info).unwrap();
        assert!(matches!(outcome, RuleRouteOutcome::Unchanged));
    }

    #[test]
    fn test_highest_priority_healthy_subset_wins() {
        let info = route_info(
            vec![instance("a", "v1", true), instance("b", "v2", true), instance("c", "v2", true)],
            vec![destination("v2", 0, 100), destination("v1", 1, 100)],
        );
        let router = router(RuleRouterConfig::default());
        assert_eq!(chosen_ids(router.route(&info).unwrap()), vec!["b", "c"]);
        // the second pass is served from the cache
        router.route(&info).unwrap();
        assert_eq!(router.cache().len(), 1);
    }

    #[test]
    fn test_unhealthy_subset_falls_to_recover_all() {
        let info = route_info(
            vec![instance("a", "v1", false), instance("b", "v1", false)],
            vec![destination("v1", 0, 100)],
        );
        let outcome = router(RuleRouterConfig::default()).route(&info).unwrap();
        assert_eq!(chosen_ids(outcome), vec!["a", "b"]);
        assert!(info.service_instances.available().is_recover_all());

        let strict = RuleRouterConfig {
            enable_recover_all: false,
            ..Default::default()
        };
        assert_eq!(router(strict).route(&info).unwrap_err(), PolarisError::RouteRuleNotMatch);
    }

    #[test]
    fn test_percent_of_min_instances() {
        let info = route_info(
            vec![instance("a", "v2", true), instance("b", "v2", false), instance("c", "v2", false)],
            vec![destination("v2", 0, 100)],
        );
        let config = RuleRouterConfig {
            percent_of_min_instances: 0.5,
            ..Default::default()
        };
        // one of three healthy is below half: recover-all uses all three
        assert_eq!(chosen_ids(router(config).route(&info).unwrap()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unmatched_inbound_is_an_error() {
        let mut info = route_info(vec![instance("a", "v1", true)], vec![destination("v1", 0, 100)]);
        if let Some(snapshot) = info.route_rule.take() {
            let mut rule = snapshot.route_rule().cloned().unwrap();
            rule.inbounds[0].sources.push(Source {
                namespace: "Test".into(),
                service: "caller".into(),
                metadata: BTreeMap::new(),
            });
            info.route_rule = Some(Arc::new(ServiceData::new(key(), "r2", ServiceDataContent::RouteRule(rule))));
        }
        let router = router(RuleRouterConfig::default());
        assert_eq!(router.route(&info).unwrap_err(), PolarisError::RouteRuleNotMatch);
        assert_eq!(router.take_not_match_count(), 1);
    }

    #[test]
    fn test_transfer_redirects() {
        let mut dest = destination("v1", 0, 100);
        dest.transfer = Some("other".into());
        let info = route_info(vec![instance("a", "v1", true)], vec![dest]);
        match router(RuleRouterConfig::default()).route(&info).unwrap() {
            RuleRouteOutcome::Redirect(target) => assert_eq!(target, ServiceKey::new("Test", "other")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_open_subset_is_replaced_by_lower_priority() {
        let info = route_info(
            vec![instance("a", "v1", true), instance("b", "v2", true)],
            vec![destination("v2", 0, 100), destination("v1", 1, 100)],
        );
        let mut infos = HashMap::new();
        infos.insert(
            "version:v2#".to_string(),
            SetUnhealthyInfo {
                status: CircuitBreakerStatus::Open,
                ..Default::default()
            },
        );
        info.service_instances
            .service()
            .set_unhealthy_sets(UnhealthySetsData { version: 1, infos });
        assert_eq!(chosen_ids(router(RuleRouterConfig::default()).route(&info).unwrap()), vec!["a"]);
    }

    #[test]
    fn test_half_open_subset_shares_with_downgrade() {
        let info = route_info(
            vec![instance("a", "v1", true), instance("b", "v2", true)],
            vec![destination("v2", 0, 100), destination("v1", 1, 100)],
        );
        let mut infos = HashMap::new();
        infos.insert(
            "version:v2#".to_string(),
            SetUnhealthyInfo {
                status: CircuitBreakerStatus::HalfOpen,
                half_open_release_percent: 0.2,
                ..Default::default()
            },
        );
        info.service_instances
            .service()
            .set_unhealthy_sets(UnhealthySetsData { version: 1, infos });

        let router = router(RuleRouterConfig::default());
        let mut released = 0;
        for _ in 0..2_000 {
            if chosen_ids(router.route(&info).unwrap()) == vec!["b"] {
                released += 1;
            }
        }
        let share = released as f64 / 2_000.0;
        assert!((share - 0.2).abs() < 0.05, "share {}", share);
    }
}
