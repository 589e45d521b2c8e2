//! Nearby routing.
//!
//! # Responsibilities
//! - Bucket instances by how much of the client's location they share
//! - Serve the closest bucket, walking out to `maxMatchLevel` when empty
//! - Degrade to wider buckets when too many close instances are unhealthy
//!
//! # Design Decisions
//! - The client location is versioned; the version is part of the cache key
//!   only for services that enable nearby routing
//! - Services without nearby routing put every instance in the configured
//!   level, so only the health split applies

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::cache::RefCountedCache;
use crate::config::schema::NearbyRouterConfig;
use crate::error::{PolarisError, PolarisResult};
use crate::model::{Instance, InstancesSet, Location};
use crate::observability::metrics;
use crate::routing::route_info::RouteInfo;
use crate::time::Clock;

pub const ROUTER_NAME: &str = "nearbyBasedRouter";

/// How much of the location two sides must share, widest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchLevel {
    None = 0,
    Region = 1,
    Zone = 2,
    Campus = 3,
}

impl MatchLevel {
    const ALL: [MatchLevel; 4] = [MatchLevel::None, MatchLevel::Region, MatchLevel::Zone, MatchLevel::Campus];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchLevel::None => "none",
            MatchLevel::Region => "region",
            MatchLevel::Zone => "zone",
            MatchLevel::Campus => "campus",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn from_index(index: usize) -> Self {
        Self::ALL.get(index).copied().unwrap_or(MatchLevel::Campus)
    }

    /// Subset entry naming this level of `location`.
    fn subset_entry(self, location: &Location) -> (String, String) {
        let value = match self {
            MatchLevel::None => String::new(),
            MatchLevel::Region => location.region.clone(),
            MatchLevel::Zone => location.zone.clone(),
            MatchLevel::Campus => location.campus.clone(),
        };
        (self.as_str().to_string(), value)
    }
}

impl fmt::Display for MatchLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchLevel {
    type Err = PolarisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| PolarisError::InvalidConfig(format!("unknown match level '{}'", s)))
    }
}

/// Location of this client, replaced as a whole.
#[derive(Debug)]
pub struct ClientLocation {
    location: ArcSwap<Location>,
    version: AtomicU64,
}

impl ClientLocation {
    pub fn new(location: Location) -> Self {
        Self {
            location: ArcSwap::from_pointee(location),
            version: AtomicU64::new(1),
        }
    }

    pub fn get(&self) -> Arc<Location> {
        self.location.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Location and the version it was published under.
    pub fn snapshot(&self) -> (Arc<Location>, u64) {
        loop {
            let version = self.version();
            let location = self.get();
            if version == self.version() {
                return (location, version);
            }
        }
    }

    /// Returns whether the location changed.
    pub fn update(&self, location: Location) -> bool {
        if *self.location.load_full() == location {
            return false;
        }
        tracing::info!(location = %location, "Client location updated");
        self.location.store(Arc::new(location));
        self.version.fetch_add(1, Ordering::AcqRel);
        true
    }
}

impl Default for ClientLocation {
    fn default() -> Self {
        Self::new(Location::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NearbyCacheKey {
    prior_set_id: u64,
    circuit_breaker_version: u64,
    request_flags: u8,
    location_version: u64,
}

#[derive(Debug, Default)]
struct LevelInstances {
    healthy: Vec<Arc<Instance>>,
    unhealthy: Vec<Arc<Instance>>,
}

impl LevelInstances {
    fn total(&self) -> usize {
        self.healthy.len() + self.unhealthy.len()
    }
}

#[derive(Debug)]
struct NearbyCluster {
    config: NearbyRouterConfig,
    match_level: MatchLevel,
    max_match_level: MatchLevel,
    levels: Vec<LevelInstances>,
}

impl NearbyCluster {
    fn new(config: &NearbyRouterConfig, match_level: MatchLevel, max_match_level: MatchLevel) -> Self {
        Self {
            config: config.clone(),
            match_level,
            max_match_level,
            levels: (0..=match_level.index()).map(|_| LevelInstances::default()).collect(),
        }
    }

    /// Count of leading location fields shared with `client`, capped at the
    /// match level. `None` places every instance at the match level.
    fn place(&mut self, client: Option<&Location>, instances: &[Arc<Instance>], unhealthy: &HashSet<String>) {
        for instance in instances {
            let level = match client {
                Some(client) => {
                    let own = &instance.location;
                    let shared = [
                        own.region == client.region,
                        own.zone == client.zone,
                        own.campus == client.campus,
                    ]
                    .iter()
                    .take_while(|same| **same)
                    .count();
                    shared.min(self.match_level.index())
                }
                None => self.match_level.index(),
            };
            let bucket = &mut self.levels[level];
            if unhealthy.contains(&instance.id) {
                bucket.unhealthy.push(instance.clone());
            } else {
                bucket.healthy.push(instance.clone());
            }
        }
    }

    /// Instances to serve, the level they came from and whether the result
    /// had to recover unhealthy or wider instances.
    fn result(&mut self) -> (Vec<Arc<Instance>>, MatchLevel, bool) {
        let max = self.max_match_level.index();
        let mut level = self.match_level.index();
        let mut total = self.levels[level].total();
        while total == 0 && level > max {
            level -= 1;
            total = self.levels[level].total();
        }
        if total == 0 {
            tracing::debug!(
                match_level = %self.match_level,
                max_match_level = %self.max_match_level,
                "No instance within the nearby match levels"
            );
            return (Vec::new(), MatchLevel::from_index(level), false);
        }

        let percent = self.config.unhealthy_percent_to_degrade as usize;
        let mut unhealthy = self.levels[level].unhealthy.len();
        if self.config.enable_degrade_by_unhealthy_percent && unhealthy * 100 >= total * percent {
            let mut degrade_to = None;
            for wider in (max..level).rev() {
                total += self.levels[wider].total();
                unhealthy += self.levels[wider].unhealthy.len();
                if unhealthy * 100 < total * percent {
                    degrade_to = Some(wider);
                    break;
                }
            }
            if let Some(degrade_to) = degrade_to {
                let mut result = Vec::with_capacity(total - unhealthy);
                for index in (degrade_to..=level).rev() {
                    result.extend(self.levels[index].healthy.iter().cloned());
                }
                return (result, MatchLevel::from_index(level), true);
            }
        }

        let bucket = &mut self.levels[level];
        if !bucket.healthy.is_empty() {
            let healthy = std::mem::take(&mut bucket.healthy);
            return (healthy, MatchLevel::from_index(level), level != self.match_level.index());
        }
        if self.config.enable_recover_all {
            return (std::mem::take(&mut bucket.unhealthy), MatchLevel::from_index(level), true);
        }
        (Vec::new(), MatchLevel::from_index(level), level != self.match_level.index())
    }
}

pub struct NearbyRouter {
    config: NearbyRouterConfig,
    match_level: MatchLevel,
    max_match_level: MatchLevel,
    location: Arc<ClientLocation>,
    cache: Arc<RefCountedCache<NearbyCacheKey, InstancesSet>>,
}

impl NearbyRouter {
    pub fn new(config: &NearbyRouterConfig, location: Arc<ClientLocation>, clock: Arc<dyn Clock>) -> PolarisResult<Self> {
        let match_level: MatchLevel = config.match_level.parse()?;
        let max_match_level: MatchLevel = config.max_match_level.parse()?;
        if match_level < max_match_level {
            return Err(PolarisError::InvalidConfig(format!(
                "max match level '{}' is narrower than match level '{}'",
                max_match_level, match_level
            )));
        }
        if config.strict_nearby {
            let current = location.get();
            let missing = [
                (MatchLevel::Region, current.region.is_empty()),
                (MatchLevel::Zone, current.zone.is_empty()),
                (MatchLevel::Campus, current.campus.is_empty()),
            ]
            .into_iter()
            .find(|(level, empty)| *level <= match_level && *empty);
            if let Some((level, _)) = missing {
                return Err(PolarisError::InvalidConfig(format!(
                    "strict nearby needs the client {} for match level '{}'",
                    level, match_level
                )));
            }
        }
        tracing::debug!(match_level = %match_level, max_match_level = %max_match_level, "Nearby router created");
        Ok(Self {
            config: config.clone(),
            match_level,
            max_match_level,
            location,
            cache: Arc::new(RefCountedCache::new("nearby_router", clock)),
        })
    }

    pub fn cache(&self) -> Arc<RefCountedCache<NearbyCacheKey, InstancesSet>> {
        self.cache.clone()
    }

    pub fn location(&self) -> &Arc<ClientLocation> {
        &self.location
    }

    /// Narrow `info`'s available instances to the nearby ones.
    pub fn route(&self, info: &mut RouteInfo) -> PolarisResult<()> {
        if info.disable_nearby {
            return Ok(());
        }
        let nearby_enabled = info.service_instances.instances_data().is_nearby_enabled();
        let (location, location_version) = if nearby_enabled {
            self.location.snapshot()
        } else {
            (self.location.get(), 0)
        };
        let prior = info.service_instances.available().clone();
        let key = NearbyCacheKey {
            prior_set_id: prior.id(),
            circuit_breaker_version: info.service_instances.service().circuit_breaker_version(),
            request_flags: info.request_flags(),
            location_version,
        };

        let chosen = self.cache.create_or_get(&key, || {
            let mut cluster = NearbyCluster::new(&self.config, self.match_level, self.max_match_level);
            let client = nearby_enabled.then_some(location.as_ref());
            cluster.place(client, prior.instances(), &info.unhealthy_set());
            let (instances, level, recover_all) = cluster.result();

            let (level_key, level_value) = level.subset_entry(&location);
            let mut subset = BTreeMap::new();
            subset.insert(level_key, level_value);
            let recover_info = if recover_all {
                let (key, value) = self.match_level.subset_entry(&location);
                format!("from {}:{}", key, value)
            } else {
                String::new()
            };
            if prior.update_recover_all(recover_all) {
                tracing::info!(
                    service = %info.service_key(),
                    location = %location,
                    location_version,
                    recover_all,
                    "Nearby router recover-all changed"
                );
                if recover_all {
                    metrics::record_recover_all(ROUTER_NAME);
                }
            }
            InstancesSet::with_subset(instances, subset, recover_info)
        });
        if nearby_enabled {
            chosen.record_access();
        }
        info.service_instances.set_available(chosen);
        Ok(())
    }
}

impl fmt::Debug for NearbyRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NearbyRouter")
            .field("match_level", &self.match_level)
            .field("max_match_level", &self.max_match_level)
            .field("cache_entries", &self.cache.len())
            .finish()
    }
}
