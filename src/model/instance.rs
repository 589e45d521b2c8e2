//! Service instances and immutable instance sets.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

pub const DEFAULT_INSTANCE_WEIGHT: u32 = 100;

/// Monotonic identity for instance sets; used as the cache key of selectors.
static NEXT_SET_ID: AtomicU64 = AtomicU64::new(1);

/// Physical location of an instance or of the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Location {
    pub region: String,
    pub zone: String,
    pub campus: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.zone, self.campus)
    }
}

/// One endpoint of a service.
///
/// Everything is fixed once the owning snapshot is published, except the
/// vnode hash cache which the fast ring build refreshes under the
/// instance's own lock.
#[derive(Debug)]
pub struct Instance {
    pub id: String,
    pub host: String,
    pub port: u32,
    pub weight: u32,
    pub dynamic_weight: Option<u32>,
    pub healthy: bool,
    pub isolated: bool,
    pub metadata: BTreeMap<String, String>,
    pub location: Location,
    local_id: u64,
    vnode_hashes: Mutex<Vec<u64>>,
}

impl Instance {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u32) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: DEFAULT_INSTANCE_WEIGHT,
            dynamic_weight: None,
            healthy: true,
            isolated: false,
            metadata: BTreeMap::new(),
            location: Location::default(),
            local_id: 0,
            vnode_hashes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_health(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    pub fn with_isolate(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn with_dynamic_weight(mut self, weight: u32) -> Self {
        self.dynamic_weight = Some(weight);
        self
    }

    /// Dense index assigned when the owning snapshot was built.
    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    /// `host:port`, the key Maglev hashes.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Exclusive access to the cached vnode hashes of this instance.
    pub fn lock_vnode_hashes(&self) -> MutexGuard<'_, Vec<u64>> {
        self.vnode_hashes.lock()
    }
}

/// Immutable ordered group of instances shared by routers and balancers.
#[derive(Debug)]
pub struct InstancesSet {
    id: u64,
    instances: Vec<Arc<Instance>>,
    subset: BTreeMap<String, String>,
    recover_info: String,
    recover_all: AtomicBool,
    access_count: AtomicU64,
}

impl InstancesSet {
    pub fn new(instances: Vec<Arc<Instance>>) -> Self {
        Self::with_subset(instances, BTreeMap::new(), String::new())
    }

    pub fn with_subset(
        instances: Vec<Arc<Instance>>,
        subset: BTreeMap<String, String>,
        recover_info: impl Into<String>,
    ) -> Self {
        Self {
            id: NEXT_SET_ID.fetch_add(1, Ordering::Relaxed),
            instances,
            subset,
            recover_info: recover_info.into(),
            recover_all: AtomicBool::new(false),
            access_count: AtomicU64::new(0),
        }
    }

    /// Identity of this generation; never reused within a process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn instances(&self) -> &[Arc<Instance>] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn subset(&self) -> &BTreeMap<String, String> {
        &self.subset
    }

    pub fn recover_info(&self) -> &str {
        &self.recover_info
    }

    pub fn is_recover_all(&self) -> bool {
        self.recover_all.load(Ordering::Acquire)
    }

    /// Record the recover-all outcome of the latest routing pass.
    /// Returns true when the flag actually flipped.
    pub fn update_recover_all(&self, recover_all: bool) -> bool {
        self.recover_all
            .compare_exchange(!recover_all, recover_all, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn record_access(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset the access counter.
    pub fn take_access_count(&self) -> u64 {
        self.access_count.swap(0, Ordering::Relaxed)
    }
}

/// The instance payload of a service snapshot.
#[derive(Debug)]
pub struct InstancesData {
    all: Arc<InstancesSet>,
    available: Arc<InstancesSet>,
    by_id: HashMap<String, Arc<Instance>>,
    service_metadata: BTreeMap<String, String>,
}

const NEARBY_ENABLE_KEY: &str = "internal-enable-nearby";

impl InstancesData {
    /// Build the snapshot, assigning dense local ids in input order.
    ///
    /// Available instances are those neither isolated nor weighted to zero.
    pub fn new(instances: Vec<Instance>, service_metadata: BTreeMap<String, String>) -> Self {
        let mut all = Vec::with_capacity(instances.len());
        let mut available = Vec::with_capacity(instances.len());
        let mut by_id = HashMap::with_capacity(instances.len());
        for (index, mut instance) in instances.into_iter().enumerate() {
            instance.local_id = index as u64;
            let instance = Arc::new(instance);
            if !instance.isolated && instance.weight > 0 {
                available.push(instance.clone());
            }
            by_id.insert(instance.id.clone(), instance.clone());
            all.push(instance);
        }
        Self {
            all: Arc::new(InstancesSet::new(all)),
            available: Arc::new(InstancesSet::new(available)),
            by_id,
            service_metadata,
        }
    }

    pub fn all(&self) -> &Arc<InstancesSet> {
        &self.all
    }

    pub fn available(&self) -> &Arc<InstancesSet> {
        &self.available
    }

    pub fn get(&self, instance_id: &str) -> Option<&Arc<Instance>> {
        self.by_id.get(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.by_id.contains_key(instance_id)
    }

    pub fn service_metadata(&self) -> &BTreeMap<String, String> {
        &self.service_metadata
    }

    /// Copy the vnode hash caches of instances that `previous` already
    /// knew, so a ring rebuild after an update only hashes new instances.
    /// Returns how many caches were carried over.
    pub fn inherit_local_values(&self, previous: &InstancesData) -> usize {
        let mut carried = 0;
        for instance in self.all.instances() {
            let Some(old) = previous.get(&instance.id) else {
                continue;
            };
            if Arc::ptr_eq(old, instance) {
                continue;
            }
            let old_hashes = old.lock_vnode_hashes();
            if old_hashes.is_empty() {
                continue;
            }
            let mut hashes = instance.lock_vnode_hashes();
            if hashes.is_empty() {
                hashes.extend_from_slice(&old_hashes);
                carried += 1;
            }
        }
        carried
    }

    /// Whether the service opted into nearby routing.
    pub fn is_nearby_enabled(&self) -> bool {
        self.service_metadata
            .get(NEARBY_ENABLE_KEY)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_excludes_isolated_and_zero_weight() {
        let data = InstancesData::new(
            vec![
                Instance::new("a", "10.0.0.1", 80),
                Instance::new("b", "10.0.0.2", 80).with_isolate(true),
                Instance::new("c", "10.0.0.3", 80).with_weight(0),
                Instance::new("d", "10.0.0.4", 80).with_health(false),
            ],
            BTreeMap::new(),
        );
        assert_eq!(data.all().len(), 4);
        let ids: Vec<&str> = data.available().instances().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
        assert_eq!(data.get("c").unwrap().local_id(), 2);
    }

    #[test]
    fn test_set_identity_is_unique() {
        let a = InstancesSet::new(Vec::new());
        let b = InstancesSet::new(Vec::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_recover_all_flag_flips_once() {
        let set = InstancesSet::new(Vec::new());
        assert!(!set.update_recover_all(false));
        assert!(set.update_recover_all(true));
        assert!(!set.update_recover_all(true));
        assert!(set.is_recover_all());
        assert!(set.update_recover_all(false));
    }

    #[test]
    fn test_inherit_local_values_only_for_surviving_ids() {
        let old = InstancesData::new(
            vec![Instance::new("a", "10.0.0.1", 80), Instance::new("gone", "10.0.0.9", 80)],
            BTreeMap::new(),
        );
        old.get("a").unwrap().lock_vnode_hashes().push(7);
        old.get("gone").unwrap().lock_vnode_hashes().push(9);
        let new = InstancesData::new(
            vec![Instance::new("a", "10.0.0.1", 80), Instance::new("b", "10.0.0.2", 80)],
            BTreeMap::new(),
        );
        assert_eq!(new.inherit_local_values(&old), 1);
        assert_eq!(*new.get("a").unwrap().lock_vnode_hashes(), vec![7]);
        assert!(new.get("b").unwrap().lock_vnode_hashes().is_empty());
    }

    #[test]
    fn test_nearby_flag() {
        let mut meta = BTreeMap::new();
        meta.insert("internal-enable-nearby".to_string(), "true".to_string());
        let data = InstancesData::new(Vec::new(), meta);
        assert!(data.is_nearby_enabled());
    }
}
