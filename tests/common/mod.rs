//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use polaris_client::circuit_breaker::set::backend::{MetricReport, MetricSummary};
use polaris_client::circuit_breaker::set::{LocalMetricsBackend, MetricKey, MetricsBackend};
use polaris_client::config::PolarisConfig;
use polaris_client::model::{Instance, InstancesData, ServiceData, ServiceDataContent, ServiceKey};
use polaris_client::time::ManualClock;
use polaris_client::{ConsumerApi, Context, PolarisError, PolarisResult};

pub const START_MS: u64 = 1_000_000;

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START_MS))
}

pub fn service_key() -> ServiceKey {
    ServiceKey::new("Test", "svc")
}

pub fn instance(index: usize, weight: u32) -> Instance {
    Instance::new(format!("inst-{}", index), format!("10.0.0.{}", index), 8080).with_weight(weight)
}

pub fn weighted_instances(weights: &[u32]) -> Vec<Instance> {
    weights.iter().enumerate().map(|(i, w)| instance(i, *w)).collect()
}

pub fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn instances_snapshot(key: ServiceKey, revision: &str, instances: Vec<Instance>) -> ServiceData {
    ServiceData::new(
        key,
        revision,
        ServiceDataContent::Instances(Arc::new(InstancesData::new(instances, BTreeMap::new()))),
    )
}

/// Api over only the services the configuration declares.
pub fn api_from_config(config: PolarisConfig, clock: Arc<ManualClock>, backend: Arc<dyn MetricsBackend>) -> ConsumerApi {
    ConsumerApi::new(Context::with_parts(config, clock, backend).unwrap())
}

/// Context on a manual clock and `backend`, with `instances` published
/// for [`service_key`].
pub fn api_with(
    config: PolarisConfig,
    clock: Arc<ManualClock>,
    backend: Arc<dyn MetricsBackend>,
    instances: Vec<Instance>,
) -> ConsumerApi {
    let api = api_from_config(config, clock, backend);
    api.context()
        .registry()
        .update(instances_snapshot(service_key(), "v1", instances));
    api
}

pub fn api(config: PolarisConfig, instances: Vec<Instance>) -> (ConsumerApi, Arc<ManualClock>) {
    let clock = manual_clock();
    let backend = Arc::new(LocalMetricsBackend::new(clock.clone()));
    (api_with(config, clock.clone(), backend, instances), clock)
}

/// Local backend whose first `failures` reports answer with a server error.
#[derive(Debug)]
pub struct ScriptedBackend {
    inner: LocalMetricsBackend,
    failures: AtomicUsize,
    reports: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(clock: Arc<ManualClock>, failures: usize) -> Self {
        Self {
            inner: LocalMetricsBackend::new(clock),
            failures: AtomicUsize::new(failures),
            reports: AtomicUsize::new(0),
        }
    }

    /// Report attempts, failed ones included.
    pub fn reports(&self) -> usize {
        self.reports.load(Ordering::SeqCst)
    }
}

impl MetricsBackend for ScriptedBackend {
    fn init(&self, key: &MetricKey, window_ms: u64, precision: u32) -> PolarisResult<()> {
        self.inner.init(key, window_ms, precision)
    }

    fn report(&self, report: &MetricReport) -> PolarisResult<()> {
        self.reports.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PolarisError::ServerError("scripted failure".into()));
        }
        self.inner.report(report)
    }

    fn query(&self, key: &MetricKey, window_ms: u64) -> PolarisResult<MetricSummary> {
        self.inner.query(key, window_ms)
    }
}
