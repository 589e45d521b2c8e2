//! Active health detection.
//!
//! # Responsibilities
//! - Periodically probe instances of every service with a breaker chain
//! - onRecover: move Open instances that answer to HalfOpen
//! - always: open instances that stop answering, close the ones that answer

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time;

use crate::circuit_breaker::{BreakerChain, CircuitBreakerExecutor};
use crate::config::schema::{HealthCheckConfig, HealthCheckWhen};
use crate::health::probe::{DetectResult, HealthProbe};
use crate::model::{CircuitBreakerStatus, Instance};
use crate::registry::ServiceDataRegistry;

pub struct HealthChecker {
    config: HealthCheckConfig,
    executor: Arc<CircuitBreakerExecutor>,
    registry: Arc<ServiceDataRegistry>,
    probe: Arc<dyn HealthProbe>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        executor: Arc<CircuitBreakerExecutor>,
        registry: Arc<ServiceDataRegistry>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            config,
            executor,
            registry,
            probe,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if self.config.when == HealthCheckWhen::Never {
            tracing::info!("Health detection disabled");
            return;
        }

        tracing::info!(
            when = ?self.config.when,
            interval_ms = self.config.interval.as_millis() as u64,
            probe = self.probe.name(),
            "Health checker starting"
        );

        let mut ticker = time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health checker received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// One detection pass over every chain. Returns the number of status
    /// changes it made.
    pub async fn check_all(&self) -> usize {
        let mut changed = 0;
        for chain in self.executor.chains() {
            changed += match self.config.when {
                HealthCheckWhen::Never => 0,
                HealthCheckWhen::OnRecover => self.check_open(&chain).await,
                HealthCheckWhen::Always => self.check_every(&chain).await,
            };
        }
        changed
    }

    async fn check_open(&self, chain: &BreakerChain) -> usize {
        let Some(data) = self.registry.instances(chain.service_key()) else {
            return 0;
        };
        let mut changed = 0;
        for id in chain.instances_in(CircuitBreakerStatus::Open) {
            let Some(instance) = data.get(&id) else {
                continue;
            };
            if self.detect(instance).await.is_success()
                && chain.translate_status(&id, CircuitBreakerStatus::Open, CircuitBreakerStatus::HalfOpen)
            {
                tracing::info!(service = %chain.service_key(), instance = %id, "Health detection recovered instance to half open");
                changed += 1;
            }
        }
        changed
    }

    async fn check_every(&self, chain: &BreakerChain) -> usize {
        let Some(data) = self.registry.instances(chain.service_key()) else {
            return 0;
        };
        let mut changed = 0;
        for instance in data.all().instances() {
            let status = chain.status(&instance.id);
            let success = self.detect(instance).await.is_success();
            let transition = match (status, success) {
                (CircuitBreakerStatus::Open, true) => Some((CircuitBreakerStatus::Open, CircuitBreakerStatus::Close)),
                (CircuitBreakerStatus::Close, false) => Some((CircuitBreakerStatus::Close, CircuitBreakerStatus::Open)),
                _ => None,
            };
            if let Some((from, to)) = transition {
                if chain.translate_status(&instance.id, from, to) {
                    tracing::info!(service = %chain.service_key(), instance = %instance.id, from = %from, to = %to, "Health detection changed instance");
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Probe, retrying failures up to `retry` extra times.
    async fn detect(&self, instance: &Instance) -> DetectResult {
        let mut result = self.probe.detect(instance, self.config.timeout).await;
        for _ in 0..self.config.retry {
            if result.is_success() {
                break;
            }
            result = self.probe.detect(instance, self.config.timeout).await;
        }
        tracing::trace!(
            instance = %instance.id,
            code = ?result.return_code,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Health probe finished"
        );
        result
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.config)
            .field("probe", &self.probe.name())
            .finish()
    }
}
