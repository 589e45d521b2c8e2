//! In-process registry of service snapshots.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwapOption, Guard};
use dashmap::DashMap;

use crate::error::{PolarisError, PolarisResult};
use crate::model::{DataStatus, DataType, InstancesData, Service, ServiceData, ServiceKey};
use crate::observability::metrics;
use crate::registry::{DataNotify, ServiceDataSource};

type DataKey = (ServiceKey, DataType);

#[derive(Debug, Default)]
struct DataEntry {
    current: ArcSwapOption<ServiceData>,
    notify: Arc<DataNotify>,
}

/// Latest snapshot per `(service, data type)` plus per-service runtime state.
///
/// Readers get a complete snapshot or none; writers replace the pointer
/// atomically. A snapshot stays alive while any reader holds it.
pub struct ServiceDataRegistry {
    entries: DashMap<DataKey, Arc<DataEntry>>,
    services: DashMap<ServiceKey, Arc<Service>>,
    source: Option<Arc<dyn ServiceDataSource>>,
}

impl ServiceDataRegistry {
    pub fn new(source: Option<Arc<dyn ServiceDataSource>>) -> Self {
        Self {
            entries: DashMap::new(),
            services: DashMap::new(),
            source,
        }
    }

    /// Current snapshot, if one was published.
    pub fn get_with_ref(&self, key: &ServiceKey, data_type: DataType) -> Option<Arc<ServiceData>> {
        let entry = self.entries.get(&(key.clone(), data_type))?.value().clone();
        entry.current.load_full()
    }

    /// Current snapshot (or the persisted copy) together with the key's
    /// readiness signal. The first call for a key subscribes it.
    pub fn load_with_notify(&self, key: &ServiceKey, data_type: DataType) -> (Option<Arc<ServiceData>>, Arc<DataNotify>) {
        let data_key = (key.clone(), data_type);
        if let Some(entry) = self.entries.get(&data_key) {
            return (entry.current.load_full(), entry.notify.clone());
        }

        let mut created = false;
        let entry = self
            .entries
            .entry(data_key)
            .or_insert_with(|| {
                created = true;
                Arc::new(DataEntry::default())
            })
            .clone();

        if created {
            if let Some(source) = &self.source {
                if let Some(persisted) = source.load_persisted(key, data_type) {
                    let persisted = persisted.with_status(DataStatus::FromDisk);
                    let none: Option<Arc<ServiceData>> = None;
                    let _ = entry.current.compare_and_swap(&none, Some(Arc::new(persisted)));
                }
                tracing::debug!(service = %key, data_type = data_type.as_str(), "Subscribing to service data");
                source.subscribe(self, key, data_type);
            }
        }
        (entry.current.load_full(), entry.notify.clone())
    }

    /// Publish a snapshot. Returns false when the same revision with the
    /// same status is already current.
    pub fn update(&self, data: ServiceData) -> bool {
        self.update_shared(Arc::new(data))
    }

    /// The revision check and the swap are one compare-and-swap, so two
    /// writers racing on the same revision publish it once.
    pub fn update_shared(&self, data: Arc<ServiceData>) -> bool {
        let data_type = data.data_type();
        let entry = self
            .entries
            .entry((data.service_key.clone(), data_type))
            .or_default()
            .clone();

        let mut current = entry.current.load_full();
        loop {
            if let Some(current) = &current {
                if current.revision == data.revision && current.status == data.status {
                    return false;
                }
                if let (Some(previous), Some(next)) = (current.instances(), data.instances()) {
                    next.inherit_local_values(previous);
                }
            }
            let swapped = Guard::into_inner(entry.current.compare_and_swap(&current, Some(data.clone())));
            let won = match (&swapped, &current) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if won {
                break;
            }
            current = swapped;
        }

        if data_type == DataType::Instances && data.status != DataStatus::NotFound {
            self.get_or_create_service(&data.service_key);
        }
        tracing::debug!(
            service = %data.service_key,
            data_type = data_type.as_str(),
            revision = %data.revision,
            status = ?data.status,
            "Service data updated"
        );
        metrics::record_registry_update(data_type.as_str());
        if data.status != DataStatus::FromDisk {
            entry.notify.notify_all();
        }
        true
    }

    /// Block until a synced snapshot is available or `timeout` elapses.
    ///
    /// On timeout a persisted copy is served if one exists.
    pub fn wait_for(&self, key: &ServiceKey, data_type: DataType, timeout: Duration) -> PolarisResult<Arc<ServiceData>> {
        let (data, notify) = self.load_with_notify(key, data_type);
        if let Some(data) = data.filter(|d| d.status != DataStatus::FromDisk) {
            return Self::check_found(data);
        }
        if !notify.wait(timeout) {
            tracing::debug!(service = %key, data_type = data_type.as_str(), "No synced data before timeout");
        }
        match self.get_with_ref(key, data_type) {
            Some(data) => Self::check_found(data),
            None => {
                tracing::warn!(service = %key, data_type = data_type.as_str(), timeout_ms = timeout.as_millis() as u64, "Timed out waiting for service data");
                Err(PolarisError::Timeout(timeout))
            }
        }
    }

    fn check_found(data: Arc<ServiceData>) -> PolarisResult<Arc<ServiceData>> {
        if data.status == DataStatus::NotFound {
            return Err(PolarisError::ResourceNotFound(format!(
                "{} {}",
                data.service_key,
                data.data_type().as_str()
            )));
        }
        Ok(data)
    }

    /// Latest instance payload of a service, if any.
    pub fn instances(&self, key: &ServiceKey) -> Option<Arc<InstancesData>> {
        self.get_with_ref(key, DataType::Instances)
            .and_then(|data| data.instances().cloned())
    }

    pub fn get_or_create_service(&self, key: &ServiceKey) -> Arc<Service> {
        if let Some(service) = self.services.get(key) {
            return service.value().clone();
        }
        self.services
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Service::new(key.clone())))
            .clone()
    }

    pub fn get_service(&self, key: &ServiceKey) -> Option<Arc<Service>> {
        self.services.get(key).map(|s| s.value().clone())
    }

    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ServiceDataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDataRegistry")
            .field("entries", &self.entries.len())
            .field("services", &self.services.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Instance, ServiceDataContent};
    use crate::registry::StaticDataSource;
    use std::collections::BTreeMap;
    use std::thread;

    fn instances(key: &ServiceKey, revision: &str) -> ServiceData {
        ServiceData::new(
            key.clone(),
            revision,
            ServiceDataContent::Instances(Arc::new(InstancesData::new(
                vec![Instance::new("a", "10.0.0.1", 80)],
                BTreeMap::new(),
            ))),
        )
    }

    #[test]
    fn test_update_swaps_and_ignores_same_revision() {
        let registry = ServiceDataRegistry::new(None);
        let key = ServiceKey::new("Test", "svc");
        assert!(registry.get_with_ref(&key, DataType::Instances).is_none());
        assert!(registry.update(instances(&key, "r1")));
        let held = registry.get_with_ref(&key, DataType::Instances).unwrap();
        assert!(!registry.update(instances(&key, "r1")));
        assert!(registry.update(instances(&key, "r2")));
        assert_eq!(held.revision, "r1");
        assert_eq!(registry.get_with_ref(&key, DataType::Instances).unwrap().revision, "r2");
        assert!(registry.get_service(&key).is_some());
    }

    #[test]
    fn test_wait_for_wakes_on_update() {
        let registry = Arc::new(ServiceDataRegistry::new(None));
        let key = ServiceKey::new("Test", "svc");
        let writer = {
            let registry = registry.clone();
            let key = key.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                registry.update(instances(&key, "r1"));
            })
        };
        let data = registry.wait_for(&key, DataType::Instances, Duration::from_secs(5)).unwrap();
        assert_eq!(data.revision, "r1");
        writer.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let registry = ServiceDataRegistry::new(None);
        let key = ServiceKey::new("Test", "missing");
        let err = registry.wait_for(&key, DataType::RouteRule, Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, PolarisError::Timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_concurrent_same_revision_published_once() {
        let registry = Arc::new(ServiceDataRegistry::new(None));
        let key = ServiceKey::new("Test", "svc");
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let key = key.clone();
                thread::spawn(move || registry.update(instances(&key, "r1")))
            })
            .collect();
        let published = writers.into_iter().map(|w| w.join().unwrap()).filter(|&published| published).count();
        assert_eq!(published, 1);
    }

    #[test]
    fn test_update_keeps_vnode_hashes_of_surviving_instances() {
        let registry = ServiceDataRegistry::new(None);
        let key = ServiceKey::new("Test", "svc");
        registry.update(instances(&key, "r1"));
        let first = registry.instances(&key).unwrap();
        first.get("a").unwrap().lock_vnode_hashes().extend([11, 22, 33]);

        let next = InstancesData::new(
            vec![Instance::new("a", "10.0.0.1", 80), Instance::new("b", "10.0.0.2", 80)],
            BTreeMap::new(),
        );
        registry.update(ServiceData::new(key.clone(), "r2", ServiceDataContent::Instances(Arc::new(next))));
        let second = registry.instances(&key).unwrap();
        assert_eq!(*second.get("a").unwrap().lock_vnode_hashes(), vec![11, 22, 33]);
        assert!(second.get("b").unwrap().lock_vnode_hashes().is_empty());
    }

    #[test]
    fn test_wait_for_with_unbounded_timeout() {
        let registry = Arc::new(ServiceDataRegistry::new(None));
        let key = ServiceKey::new("Test", "svc");
        let writer = {
            let registry = registry.clone();
            let key = key.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                registry.update(instances(&key, "r1"));
            })
        };
        let data = registry.wait_for(&key, DataType::Instances, Duration::MAX).unwrap();
        assert_eq!(data.revision, "r1");
        writer.join().unwrap();
    }

    #[test]
    fn test_static_source_answers_subscriptions() {
        let known = ServiceKey::new("Test", "known");
        let source = Arc::new(StaticDataSource::new(vec![instances(&known, "s1")]));
        let registry = ServiceDataRegistry::new(Some(source));
        let data = registry.wait_for(&known, DataType::Instances, Duration::from_millis(10)).unwrap();
        assert_eq!(data.revision, "s1");

        let unknown = ServiceKey::new("Test", "unknown");
        let err = registry.wait_for(&unknown, DataType::Instances, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, PolarisError::ResourceNotFound(_)));
    }
}
