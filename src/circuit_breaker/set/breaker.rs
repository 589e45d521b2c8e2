//! Per-service subset breaker.

use std::sync::Arc;

use crate::circuit_breaker::set::backend::{init_metric, query_metric, report_with_retry, MetricReport, MetricsBackend};
use crate::circuit_breaker::set::chain_data::SetChainData;
use crate::circuit_breaker::set::metric_window::{classify, MetricWindow, MetricWindowManager};
use crate::model::breaker_rule::BreakScope;
use crate::model::circuit_breaker::{CircuitChangeRecord, SetUnhealthyInfo};
use crate::model::{CallResult, DataType, Service, ServiceData, ServiceKey};
use crate::registry::ServiceDataRegistry;
use crate::time::Clock;

#[derive(Debug)]
pub struct SetCircuitBreaker {
    service_key: ServiceKey,
    registry: Arc<ServiceDataRegistry>,
    backend: Arc<dyn MetricsBackend>,
    clock: Arc<dyn Clock>,
    windows: MetricWindowManager,
    data: SetChainData,
}

impl SetCircuitBreaker {
    pub fn new(
        service_key: ServiceKey,
        registry: Arc<ServiceDataRegistry>,
        backend: Arc<dyn MetricsBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            data: SetChainData::new(service_key.clone()),
            service_key,
            registry,
            backend,
            clock,
            windows: MetricWindowManager::new(),
        }
    }

    fn rules(&self) -> Option<Arc<ServiceData>> {
        self.registry
            .get_with_ref(&self.service_key, DataType::CircuitBreakerConfig)
            .or_else(|| {
                self.registry
                    .load_with_notify(&self.service_key, DataType::CircuitBreakerConfig)
                    .0
            })
    }

    /// Count a call toward its `(subset, labels)` window. Calls without
    /// subset and labels, or matching no rule, are ignored.
    pub fn realtime(&self, result: &CallResult) {
        if result.subset.is_empty() && result.labels.is_empty() {
            return;
        }
        let Some(snapshot) = self.rules() else {
            return;
        };
        let Some(rules) = snapshot.circuit_breaker_rules() else {
            return;
        };
        let Some(dst) = rules.match_destination(result.source.as_ref(), &result.labels, &self.service_key, &result.subset)
        else {
            return;
        };
        let Some(outcome) = classify(dst, result) else {
            return;
        };
        let now = self.clock.now_ms();
        let window = self.windows.get_or_update(
            &self.service_key,
            &result.subset,
            &result.labels,
            dst,
            &snapshot.revision,
            now,
        );
        window.add(outcome, now);
        if dst.scope == BreakScope::All && !result.labels.is_empty() {
            // the subset-wide key needs its own counts to recover
            let subset_window = self.windows.get_or_update(
                &self.service_key,
                &result.subset,
                &Default::default(),
                dst,
                &snapshot.revision,
                now,
            );
            subset_window.add(outcome, now);
        }
    }

    /// Report due windows, judge them from the backend's answer, publish
    /// the unhealthy sets and drop idle windows.
    ///
    /// Runs on the metric report task, never on the instance timing pass.
    pub async fn report_pass(&self, service: &Service) {
        let now = self.clock.now_ms();
        for window in self.windows.windows() {
            if window.is_deleted() || !window.take_report_due(now) {
                continue;
            }
            self.report_and_judge(&window, now).await;
        }
        self.data.check_and_sync(service);
        let removed = self
            .windows
            .gc(now, &|w| self.data.info(w.window_key()).is_some());
        if removed > 0 {
            tracing::debug!(service = %self.service_key, removed, "Idle metric windows dropped");
        }
    }

    async fn report_and_judge(&self, window: &MetricWindow, now_ms: u64) {
        let dst = window.destination();
        if !window.is_initialized() {
            if let Err(e) = init_metric(&self.backend, window.key(), dst.metric_window_ms, dst.metric_precision).await {
                tracing::warn!(service = %self.service_key, window = window.window_key(), error = %e, "Metric window init failed");
                return;
            }
            window.mark_initialized();
        }

        let counts = window.drain();
        if !counts.is_empty() {
            let report = MetricReport {
                key: window.key().clone(),
                timestamp_ms: now_ms,
                counts,
            };
            if let Err(e) = report_with_retry(&self.backend, &report).await {
                tracing::warn!(service = %self.service_key, window = window.window_key(), error = %e, "Metric report dropped");
            }
        }

        match query_metric(&self.backend, window.key(), dst.metric_window_ms).await {
            Ok(summary) => self.data.judge(window.window_key(), window.subset_key(), dst, &summary),
            Err(e) => {
                tracing::warn!(service = %self.service_key, window = window.window_key(), error = %e, "Metric query failed");
            }
        }
    }

    pub fn status(&self, key: &str) -> Option<SetUnhealthyInfo> {
        self.data.info(key)
    }

    pub fn records(&self, key: &str) -> Vec<CircuitChangeRecord> {
        self.data.records(key)
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::set::backend::LocalMetricsBackend;
    use crate::model::breaker_rule::{CbRule, CircuitBreakerRules, DestinationSet, SourceMatcher};
    use crate::model::match_string::MatchString;
    use crate::model::{CallRetStatus, CircuitBreakerStatus, ServiceDataContent};
    use crate::time::ManualClock;
    use std::collections::BTreeMap;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn setup(scope: BreakScope) -> (SetCircuitBreaker, Arc<ManualClock>, Service) {
        let key = ServiceKey::new("Test", "svc");
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = Arc::new(ServiceDataRegistry::new(None));

        let mut dst = DestinationSet::default();
        dst.metadata.insert("set".into(), MatchString::exact("s1"));
        dst.scope = scope;
        dst.recover.sleep_window_ms = 10_000;
        let mut source = SourceMatcher::default();
        source.labels.insert("method".into(), MatchString::exact("Get"));
        let rules = CircuitBreakerRules {
            id: "cb".into(),
            inbounds: vec![CbRule {
                sources: vec![source],
                destinations: vec![dst],
            }],
        };
        registry.update(ServiceData::new(key.clone(), "r1", ServiceDataContent::CircuitBreakerConfig(rules)));

        let backend = Arc::new(LocalMetricsBackend::new(clock.clone()));
        let breaker = SetCircuitBreaker::new(key.clone(), registry, backend, clock.clone());
        (breaker, clock, Service::new(key))
    }

    fn call(status: CallRetStatus) -> CallResult {
        let mut result = CallResult::new(ServiceKey::new("Test", "svc"), "i1", status);
        result.subset = map(&[("set", "s1")]);
        result.labels = map(&[("method", "Get")]);
        result
    }

    #[tokio::test]
    async fn test_errors_open_subset_label() {
        let (breaker, clock, service) = setup(BreakScope::Labels);
        for _ in 0..6 {
            breaker.realtime(&call(CallRetStatus::Error));
        }
        for _ in 0..4 {
            breaker.realtime(&call(CallRetStatus::Ok));
        }
        let mut unmatched = call(CallRetStatus::Error);
        unmatched.labels = map(&[("method", "Put")]);
        breaker.realtime(&unmatched);
        assert_eq!(breaker.window_count(), 1);

        // nothing reported before the update interval
        breaker.report_pass(&service).await;
        assert!(breaker.status("set:s1#method:Get").is_none());

        clock.advance_ms(5_000);
        breaker.report_pass(&service).await;
        let info = breaker.status("set:s1#method:Get").unwrap();
        assert_eq!(info.status, CircuitBreakerStatus::Open);
        let published = service.unhealthy_sets();
        assert_eq!(
            published.infos.get("set:s1#method:Get").map(|i| i.status),
            Some(CircuitBreakerStatus::Open)
        );

        // half open after the sleep window, with everything released
        clock.advance_ms(10_000);
        breaker.report_pass(&service).await;
        let info = breaker.status("set:s1#method:Get").unwrap();
        assert_eq!(info.status, CircuitBreakerStatus::HalfOpen);
        assert_eq!(info.half_open_release_percent, 1.0);
    }

    #[tokio::test]
    async fn test_scope_all_opens_subset_key() {
        let (breaker, clock, service) = setup(BreakScope::All);
        for _ in 0..10 {
            breaker.realtime(&call(CallRetStatus::Error));
        }
        assert_eq!(breaker.window_count(), 2);
        clock.advance_ms(5_000);
        breaker.report_pass(&service).await;
        assert_eq!(breaker.status("set:s1#").map(|i| i.status), Some(CircuitBreakerStatus::Open));
        assert!(service.unhealthy_sets().infos.contains_key("set:s1#method:Get"));
    }

    #[tokio::test]
    async fn test_calls_without_subset_are_ignored() {
        let (breaker, _, _) = setup(BreakScope::Labels);
        breaker.realtime(&CallResult::new(ServiceKey::new("Test", "svc"), "i1", CallRetStatus::Error));
        assert_eq!(breaker.window_count(), 0);
    }
}
