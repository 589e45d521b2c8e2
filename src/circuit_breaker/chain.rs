//! Per-service breaker chain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::circuit_breaker::chain_data::{ChainData, SlotInfo, HEALTH_CHECK_SLOT_NAME};
use crate::circuit_breaker::set::{MetricsBackend, SetCircuitBreaker};
use crate::circuit_breaker::{ErrorCountBreaker, ErrorRateBreaker, InstanceBreaker, InstanceBreakerKind};
use crate::config::schema::{CircuitBreakerConfig, HealthCheckConfig, HealthCheckWhen};
use crate::model::circuit_breaker::CircuitChangeRecord;
use crate::model::{CallResult, CircuitBreakerStatus, Service, ServiceKey};
use crate::registry::ServiceDataRegistry;
use crate::time::Clock;

/// Instance breakers, the health slot and the set breaker of one service.
#[derive(Debug)]
pub struct BreakerChain {
    service_key: ServiceKey,
    breakers: Vec<InstanceBreaker>,
    data: ChainData,
    /// Slot index of health detection, when it runs always.
    health_slot: Option<usize>,
    auto_half_open: bool,
    set_breaker: Option<SetCircuitBreaker>,
    service: Arc<Service>,
    registry: Arc<ServiceDataRegistry>,
    clock: Arc<dyn Clock>,
    check_period_ms: u64,
    next_check_ms: AtomicU64,
}

impl BreakerChain {
    /// Unknown chain names are skipped; configuration validation rejects
    /// them before this point.
    pub fn new(
        service_key: ServiceKey,
        config: &CircuitBreakerConfig,
        health: &HealthCheckConfig,
        registry: Arc<ServiceDataRegistry>,
        backend: Arc<dyn MetricsBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut breakers = Vec::new();
        for name in &config.chain {
            match name.parse::<InstanceBreakerKind>() {
                Ok(InstanceBreakerKind::ErrorCount) => {
                    breakers.push(InstanceBreaker::ErrorCount(ErrorCountBreaker::new(&config.error_count, clock.clone())))
                }
                Ok(InstanceBreakerKind::ErrorRate) => {
                    breakers.push(InstanceBreaker::ErrorRate(ErrorRateBreaker::new(&config.error_rate, clock.clone())))
                }
                Err(e) => tracing::warn!(service = %service_key, error = %e, "Skipping circuit breaker"),
            }
        }

        let mut slots: Vec<SlotInfo> = breakers
            .iter()
            .map(|b| SlotInfo {
                name: b.name(),
                request_after_half_open: b.request_after_half_open(),
            })
            .collect();
        let health_slot = if health.when == HealthCheckWhen::Always {
            slots.push(SlotInfo {
                name: HEALTH_CHECK_SLOT_NAME,
                request_after_half_open: 0,
            });
            Some(slots.len())
        } else {
            None
        };

        let set_breaker = config.set_circuit_breaker.enable.then(|| {
            SetCircuitBreaker::new(service_key.clone(), registry.clone(), backend, clock.clone())
        });

        tracing::debug!(
            service = %service_key,
            breakers = breakers.len(),
            health_slot = health_slot.is_some(),
            set_breaker = set_breaker.is_some(),
            "Circuit breaker chain created"
        );
        let now = clock.now_ms();
        let check_period_ms = config.check_period.as_millis() as u64;
        Self {
            data: ChainData::new(service_key.clone(), slots, clock.clone()),
            service: registry.get_or_create_service(&service_key),
            service_key,
            breakers,
            health_slot,
            auto_half_open: health.when == HealthCheckWhen::Never,
            set_breaker,
            registry,
            clock,
            check_period_ms,
            next_check_ms: AtomicU64::new(now + check_period_ms),
        }
    }

    pub fn service_key(&self) -> &ServiceKey {
        &self.service_key
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Feed a call result to every breaker and publish what changed.
    pub fn realtime(&self, result: &CallResult) {
        if !result.instance_id.is_empty() {
            let success = result.is_success();
            for (index, breaker) in self.breakers.iter().enumerate() {
                let handle = self.data.handle(index + 1, self.auto_half_open);
                breaker.realtime(&result.instance_id, success, &handle);
            }
            self.data.check_and_sync(&self.service);
        }
        if let Some(set_breaker) = &self.set_breaker {
            set_breaker.realtime(result);
        }
    }

    /// Run the instance timing pass when its period elapsed. Returns
    /// whether it ran.
    pub fn timing(&self) -> bool {
        let now = self.clock.now_ms();
        if now < self.next_check_ms.load(Ordering::Acquire) {
            return false;
        }
        self.next_check_ms.store(now + self.check_period_ms, Ordering::Release);

        let instances = self.registry.instances(&self.service_key);
        let exists = |id: &str| instances.as_ref().map(|data| data.contains(id)).unwrap_or(true);
        for (index, breaker) in self.breakers.iter().enumerate() {
            let handle = self.data.handle(index + 1, self.auto_half_open);
            breaker.timing(&handle);
            breaker.clean_status(&handle, &exists);
        }
        self.data.retain_records(&exists);
        self.data.check_and_sync(&self.service);
        true
    }

    /// Report and judge the subset windows that are due.
    pub async fn report_set_metrics(&self) {
        if let Some(set_breaker) = &self.set_breaker {
            set_breaker.report_pass(&self.service).await;
        }
    }

    /// Transition requested by health detection.
    ///
    /// Close → Open goes through the health slot only. Other transitions are
    /// applied by whichever slot holds the instance.
    pub fn translate_status(&self, instance_id: &str, from: CircuitBreakerStatus, to: CircuitBreakerStatus) -> bool {
        let changed = if from == CircuitBreakerStatus::Close && to == CircuitBreakerStatus::Open {
            match self.health_slot {
                Some(slot) => self.data.translate(slot, instance_id, from, to),
                None => false,
            }
        } else {
            let slots = self.breakers.len() + usize::from(self.health_slot.is_some());
            let applied = (1..=slots).find(|slot| self.data.translate(*slot, instance_id, from, to));
            if let Some(breaker) = applied.and_then(|slot| self.breakers.get(slot - 1)) {
                match to {
                    CircuitBreakerStatus::HalfOpen => breaker.detect_to_half_open(instance_id),
                    CircuitBreakerStatus::Close => breaker.detect_to_close(instance_id),
                    _ => {}
                }
            }
            applied.is_some()
        };
        if changed {
            self.data.check_and_sync(&self.service);
        }
        changed
    }

    pub fn status(&self, instance_id: &str) -> CircuitBreakerStatus {
        self.data.status(instance_id)
    }

    pub fn instances_in(&self, status: CircuitBreakerStatus) -> Vec<String> {
        self.data.instances_in(status)
    }

    pub fn records(&self, instance_id: &str) -> Vec<CircuitChangeRecord> {
        self.data.records(instance_id)
    }

    pub fn version(&self) -> u64 {
        self.data.version()
    }

    pub fn set_breaker(&self) -> Option<&SetCircuitBreaker> {
        self.set_breaker.as_ref()
    }

    pub fn has_health_slot(&self) -> bool {
        self.health_slot.is_some()
    }
}
