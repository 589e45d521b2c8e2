//! Owns every service's breaker chain and drives the timing task and the
//! subset metric report task.
//!
//! The two tasks run on separate intervals: a slow or failing metric
//! backend delays subset verdicts only, never instance Open → HalfOpen.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time;

use crate::circuit_breaker::chain::BreakerChain;
use crate::circuit_breaker::chain_data::MAX_RECORDS_PER_INSTANCE;
use crate::circuit_breaker::set::MetricsBackend;
use crate::config::schema::{CircuitBreakerConfig, HealthCheckConfig};
use crate::config::validation::MIN_CHECK_PERIOD;
use crate::error::{PolarisError, PolarisResult};
use crate::model::{CallResult, CircuitBreakerStatus, DataStatus, DataType, ServiceKey};
use crate::registry::ServiceDataRegistry;
use crate::time::Clock;

pub struct CircuitBreakerExecutor {
    config: CircuitBreakerConfig,
    health: HealthCheckConfig,
    registry: Arc<ServiceDataRegistry>,
    backend: Arc<dyn MetricsBackend>,
    clock: Arc<dyn Clock>,
    chains: DashMap<ServiceKey, Arc<BreakerChain>>,
}

impl CircuitBreakerExecutor {
    pub fn new(
        config: CircuitBreakerConfig,
        health: HealthCheckConfig,
        registry: Arc<ServiceDataRegistry>,
        backend: Arc<dyn MetricsBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            health,
            registry,
            backend,
            clock,
            chains: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enable
    }

    /// Chain of `key`, created on first use.
    pub fn chain(&self, key: &ServiceKey) -> Arc<BreakerChain> {
        if let Some(chain) = self.chains.get(key) {
            return chain.clone();
        }
        self.chains
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(BreakerChain::new(
                    key.clone(),
                    &self.config,
                    &self.health,
                    self.registry.clone(),
                    self.backend.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn get_chain(&self, key: &ServiceKey) -> Option<Arc<BreakerChain>> {
        self.chains.get(key).map(|c| c.clone())
    }

    pub fn chains(&self) -> Vec<Arc<BreakerChain>> {
        self.chains.iter().map(|c| c.value().clone()).collect()
    }

    pub fn update_call_result(&self, result: &CallResult) -> PolarisResult<()> {
        if result.service_key.namespace.is_empty() || result.service_key.name.is_empty() {
            return Err(PolarisError::InvalidArgument("call result without service".into()));
        }
        if result.instance_id.is_empty() && result.subset.is_empty() && result.labels.is_empty() {
            return Err(PolarisError::InvalidArgument(format!(
                "call result for {} names no instance, subset or labels",
                result.service_key
            )));
        }
        if !self.config.enable {
            return Ok(());
        }
        self.chain(&result.service_key).realtime(result);
        Ok(())
    }

    pub fn status(&self, key: &ServiceKey, instance_id: &str) -> CircuitBreakerStatus {
        self.get_chain(key)
            .map(|chain| chain.status(instance_id))
            .unwrap_or_default()
    }

    /// Whether the registry reports `key` as gone.
    fn is_departed(&self, key: &ServiceKey) -> bool {
        self.registry
            .get_with_ref(key, DataType::Instances)
            .map(|data| data.status == DataStatus::NotFound)
            .unwrap_or(false)
    }

    /// One instance timing pass over every chain whose period elapsed.
    /// Chains of services that left the registry are dropped first.
    pub fn timing_once(&self) -> usize {
        let departed: Vec<ServiceKey> = self
            .chains
            .iter()
            .map(|c| c.key().clone())
            .filter(|key| self.is_departed(key))
            .collect();
        for key in departed {
            self.chains.remove(&key);
            tracing::debug!(service = %key, "Circuit breaker chain of departed service dropped");
        }

        let mut ran = 0;
        for chain in self.chains() {
            if chain.timing() {
                ran += 1;
            }
        }
        ran
    }

    /// One subset metric report pass. Services report concurrently, so a
    /// failing backend for one does not hold back the others.
    pub async fn report_once(&self) -> usize {
        let mut tasks = JoinSet::new();
        for chain in self.chains() {
            if chain.set_breaker().is_some() {
                tasks.spawn(async move { chain.report_set_metrics().await });
            }
        }
        let mut reported = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(()) => reported += 1,
                Err(e) => tracing::error!(error = %e, "Subset metric report task failed"),
            }
        }
        reported
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enable {
            tracing::info!("Circuit breaking disabled");
            return;
        }
        let period = self.config.check_period.max(MIN_CHECK_PERIOD);
        tracing::info!(
            check_period_ms = period.as_millis() as u64,
            chain = ?self.config.chain,
            max_records = MAX_RECORDS_PER_INSTANCE,
            "Circuit breaker timing task starting"
        );
        // chains keep their own deadlines; tick faster so none waits a full
        // extra period
        let mut ticker = time::interval((period / 2).max(Duration::from_millis(50)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ran = self.timing_once();
                    tracing::trace!(chains = ran, "Circuit breaker timing pass");
                }
                _ = shutdown.recv() => {
                    tracing::info!("Circuit breaker timing task received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    pub async fn run_set_reports(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let set_config = &self.config.set_circuit_breaker;
        if !self.config.enable || !set_config.enable {
            tracing::info!("Set circuit breaking disabled");
            return;
        }
        let period = set_config.report_interval.max(MIN_CHECK_PERIOD);
        tracing::info!(report_interval_ms = period.as_millis() as u64, "Set circuit breaker report task starting");
        let mut ticker = time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reported = self.report_once().await;
                    tracing::trace!(chains = reported, "Subset metric report pass");
                }
                _ = shutdown.recv() => {
                    tracing::info!("Set circuit breaker report task received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreakerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerExecutor")
            .field("enable", &self.config.enable)
            .field("chains", &self.chains.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::set::LocalMetricsBackend;
    use crate::model::{CallRetStatus, ServiceData};
    use crate::time::ManualClock;

    fn executor(enable: bool) -> (CircuitBreakerExecutor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let config = CircuitBreakerConfig {
            enable,
            ..Default::default()
        };
        let backend = Arc::new(LocalMetricsBackend::new(clock.clone()));
        let executor = CircuitBreakerExecutor::new(
            config,
            HealthCheckConfig::default(),
            Arc::new(ServiceDataRegistry::new(None)),
            backend,
            clock.clone(),
        );
        (executor, clock)
    }

    #[test]
    fn test_rejects_incomplete_results() {
        let (executor, _) = executor(true);
        let anonymous = CallResult::new(ServiceKey::default(), "i1", CallRetStatus::Ok);
        assert!(matches!(executor.update_call_result(&anonymous), Err(PolarisError::InvalidArgument(_))));
        let no_target = CallResult::new(ServiceKey::new("Test", "svc"), "", CallRetStatus::Ok);
        assert!(executor.update_call_result(&no_target).is_err());
    }

    #[test]
    fn test_disabled_executor_tracks_nothing() {
        let (executor, _) = executor(false);
        let key = ServiceKey::new("Test", "svc");
        for _ in 0..20 {
            executor
                .update_call_result(&CallResult::new(key.clone(), "i1", CallRetStatus::Error))
                .unwrap();
        }
        assert!(executor.chains().is_empty());
        assert_eq!(executor.status(&key, "i1"), CircuitBreakerStatus::Close);
    }

    #[test]
    fn test_timing_once_respects_period() {
        let (executor, clock) = executor(true);
        let key = ServiceKey::new("Test", "svc");
        for _ in 0..10 {
            executor
                .update_call_result(&CallResult::new(key.clone(), "i1", CallRetStatus::Error))
                .unwrap();
        }
        assert_eq!(executor.status(&key, "i1"), CircuitBreakerStatus::Open);
        assert_eq!(executor.timing_once(), 0);
        clock.advance_ms(1_000);
        assert_eq!(executor.timing_once(), 1);
    }

    #[test]
    fn test_departed_service_chain_is_dropped() {
        let (executor, clock) = executor(true);
        let kept = ServiceKey::new("Test", "kept");
        let gone = ServiceKey::new("Test", "gone");
        for key in [&kept, &gone] {
            executor
                .update_call_result(&CallResult::new(key.clone(), "i1", CallRetStatus::Error))
                .unwrap();
        }
        executor
            .registry
            .update(ServiceData::not_found(gone.clone(), DataType::Instances));
        clock.advance_ms(1_000);
        assert_eq!(executor.timing_once(), 1);
        assert!(executor.get_chain(&gone).is_none());
        assert!(executor.get_chain(&kept).is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (executor, _) = executor(true);
        let (tx, rx) = broadcast::channel(1);
        let executor = Arc::new(executor);
        let timing = tokio::spawn(executor.clone().run(rx));
        let reports = tokio::spawn(executor.run_set_reports(tx.subscribe()));
        tx.send(()).unwrap();
        timing.await.unwrap();
        reports.await.unwrap();
    }
}
