//! Shared client state.
//!
//! # Responsibilities
//! - Own the registry, breaker executor, balancers, router chain and caches
//! - Start and stop the background tasks
//! - Swap in static services when the configuration file changes

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::cache::CacheSweeper;
use crate::circuit_breaker::set::{LocalMetricsBackend, MetricsBackend};
use crate::circuit_breaker::CircuitBreakerExecutor;
use crate::config::schema::PolarisConfig;
use crate::error::{PolarisError, PolarisResult};
use crate::hash::HashRegistry;
use crate::health::{HealthChecker, HealthProbe, TcpProbe};
use crate::lifecycle::Shutdown;
use crate::load_balancer::{LoadBalanceType, LoadBalancer};
use crate::registry::{ServiceDataRegistry, ServiceDataSource, StaticDataSource};
use crate::routing::{ClientLocation, RouterChain};
use crate::time::{Clock, SystemClock};

pub struct Context {
    config: PolarisConfig,
    clock: Arc<dyn Clock>,
    hashes: HashRegistry,
    source: Arc<StaticDataSource>,
    registry: Arc<ServiceDataRegistry>,
    executor: Arc<CircuitBreakerExecutor>,
    default_lb: LoadBalanceType,
    balancers: HashMap<LoadBalanceType, LoadBalancer>,
    location: Arc<ClientLocation>,
    router: RouterChain,
    sweeper: Arc<CacheSweeper>,
    shutdown: Shutdown,
}

impl Context {
    /// Context on the system clock with an in-process metrics backend.
    pub fn new(config: PolarisConfig) -> PolarisResult<Arc<Self>> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backend = Arc::new(LocalMetricsBackend::new(clock.clone()));
        Self::with_parts(config, clock, backend)
    }

    pub fn with_parts(
        config: PolarisConfig,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn MetricsBackend>,
    ) -> PolarisResult<Arc<Self>> {
        if let Err(errors) = crate::config::validation::validate_config(&config) {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(PolarisError::InvalidConfig(joined.join("; ")));
        }

        let hashes = HashRegistry::new();
        let default_lb: LoadBalanceType = config.consumer.load_balancer.lb_type.parse()?;
        let sweeper = Arc::new(CacheSweeper::new());
        let mut balancers = HashMap::new();
        for lb_type in LoadBalanceType::ALL {
            let balancer = LoadBalancer::new(lb_type, &config.consumer.load_balancer, &hashes, clock.clone())?;
            sweeper.register(balancer.cache());
            balancers.insert(lb_type, balancer);
        }

        let location = Arc::new(ClientLocation::new(config.global.location.clone()));
        let router = RouterChain::new(&config.consumer.service_router, location.clone(), clock.clone())?;
        for cache in router.caches() {
            sweeper.register(cache);
        }

        let source = Arc::new(StaticDataSource::new(config.static_snapshots()));
        let dyn_source: Arc<dyn ServiceDataSource> = source.clone();
        let registry = Arc::new(ServiceDataRegistry::new(Some(dyn_source)));
        let executor = Arc::new(CircuitBreakerExecutor::new(
            config.consumer.circuit_breaker.clone(),
            config.consumer.health_check.clone(),
            registry.clone(),
            backend,
            clock.clone(),
        ));

        tracing::info!(
            lb_type = %default_lb,
            static_snapshots = source.len(),
            location = %config.global.location,
            "Client context created"
        );
        Ok(Arc::new(Self {
            config,
            clock,
            hashes,
            source,
            registry,
            executor,
            default_lb,
            balancers,
            location,
            router,
            sweeper,
            shutdown: Shutdown::new(),
        }))
    }

    pub fn config(&self) -> &PolarisConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn hashes(&self) -> &HashRegistry {
        &self.hashes
    }

    pub fn registry(&self) -> &Arc<ServiceDataRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<CircuitBreakerExecutor> {
        &self.executor
    }

    pub fn location(&self) -> &Arc<ClientLocation> {
        &self.location
    }

    pub fn router(&self) -> &RouterChain {
        &self.router
    }

    pub fn sweeper(&self) -> &Arc<CacheSweeper> {
        &self.sweeper
    }

    pub fn default_lb_type(&self) -> LoadBalanceType {
        self.default_lb
    }

    /// Balancer of `lb_type`, or the configured one.
    pub fn balancer(&self, lb_type: Option<LoadBalanceType>) -> PolarisResult<&LoadBalancer> {
        let lb_type = lb_type.unwrap_or(self.default_lb);
        self.balancers
            .get(&lb_type)
            .ok_or_else(|| PolarisError::InvalidArgument(format!("load balancer '{}' not available", lb_type)))
    }

    /// Publish the static services of a reloaded configuration.
    pub fn reload_services(&self, config: &PolarisConfig) -> usize {
        let changed = self.source.replace(&self.registry, config.static_snapshots());
        self.location.update(config.global.location.clone());
        tracing::info!(changed, "Static services reloaded");
        changed
    }

    /// Spawn the breaker timing, subset metric report, cache sweeper and
    /// health detection tasks.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.start_with_probe(Arc::new(TcpProbe))
    }

    pub fn start_with_probe(self: &Arc<Self>, probe: Arc<dyn HealthProbe>) -> Vec<JoinHandle<()>> {
        if self.shutdown.is_triggered() {
            tracing::warn!("Client context already shut down, not starting tasks");
            return Vec::new();
        }
        let checker = Arc::new(HealthChecker::new(
            self.config.consumer.health_check.clone(),
            self.executor.clone(),
            self.registry.clone(),
            probe,
        ));
        vec![
            tokio::spawn(self.executor.clone().run(self.shutdown.subscribe())),
            tokio::spawn(self.executor.clone().run_set_reports(self.shutdown.subscribe())),
            tokio::spawn(
                self.sweeper
                    .clone()
                    .run(self.config.global.cache_clear_time, self.shutdown.subscribe()),
            ),
            tokio::spawn(checker.run(self.shutdown.subscribe())),
        ]
    }

    pub fn shutdown(&self) {
        let tasks = self.shutdown.receiver_count();
        if self.shutdown.trigger() {
            tracing::info!(tasks, "Client context shutting down");
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("default_lb", &self.default_lb)
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .field("router", &self.router)
            .finish()
    }
}
