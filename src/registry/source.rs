//! Where snapshots come from.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::model::{DataType, ServiceData, ServiceKey};
use crate::registry::ServiceDataRegistry;

/// Provider of service snapshots.
///
/// The registry subscribes once per key, the first time the key is asked
/// for. Implementations push data back through [`ServiceDataRegistry::update`],
/// immediately or later from their own tasks.
pub trait ServiceDataSource: Send + Sync {
    fn subscribe(&self, registry: &ServiceDataRegistry, key: &ServiceKey, data_type: DataType);

    /// Locally kept copy served while the first sync is pending.
    fn load_persisted(&self, _key: &ServiceKey, _data_type: DataType) -> Option<ServiceData> {
        None
    }
}

/// Serves snapshots declared in the configuration file.
///
/// Keys it does not know are answered with a not-found snapshot so that
/// waiters fail fast instead of timing out.
#[derive(Default)]
pub struct StaticDataSource {
    snapshots: RwLock<HashMap<(ServiceKey, DataType), Arc<ServiceData>>>,
}

impl StaticDataSource {
    pub fn new(snapshots: Vec<ServiceData>) -> Self {
        let source = Self::default();
        let _ = source.store(snapshots);
        source
    }

    /// Returns the keys that were served before and are gone now.
    fn store(&self, snapshots: Vec<ServiceData>) -> Vec<(ServiceKey, DataType)> {
        let mut map = self.snapshots.write();
        let mut previous = std::mem::take(&mut *map);
        for data in snapshots {
            let key = (data.service_key.clone(), data.data_type());
            previous.remove(&key);
            map.insert(key, Arc::new(data));
        }
        previous.into_keys().collect()
    }

    /// Swap in a new set of snapshots and publish the changed ones.
    /// Removed keys are published as not found.
    pub fn replace(&self, registry: &ServiceDataRegistry, snapshots: Vec<ServiceData>) -> usize {
        let removed = self.store(snapshots);
        let current: Vec<Arc<ServiceData>> = self.snapshots.read().values().cloned().collect();
        let mut changed = current
            .into_iter()
            .filter(|data| registry.update_shared(data.clone()))
            .count();
        for (key, data_type) in removed {
            if registry.get_with_ref(&key, data_type).is_some() {
                tracing::info!(service = %key, data_type = data_type.as_str(), "Static snapshot removed");
                if registry.update(ServiceData::not_found(key, data_type)) {
                    changed += 1;
                }
            }
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

impl ServiceDataSource for StaticDataSource {
    fn subscribe(&self, registry: &ServiceDataRegistry, key: &ServiceKey, data_type: DataType) {
        let found = self.snapshots.read().get(&(key.clone(), data_type)).cloned();
        match found {
            Some(data) => {
                registry.update_shared(data);
            }
            None => {
                tracing::debug!(service = %key, data_type = data_type.as_str(), "No static snapshot configured");
                registry.update(ServiceData::not_found(key.clone(), data_type));
            }
        }
    }
}
