//! Shared instance status map of one service's breaker chain.
//!
//! # Responsibilities
//! - Track, per instance, the non-Close status and the breaker owning it
//! - Refuse transitions from a breaker that does not own the instance
//! - Version every change and keep a short audit trail per instance
//! - Publish the open / half-open view to the service when it changed

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::circuit_breaker::{CircuitBreakerData, CircuitChangeRecord};
use crate::model::{CircuitBreakerStatus, Service, ServiceKey};
use crate::observability::metrics;
use crate::time::Clock;

/// Audit records kept per instance.
pub const MAX_RECORDS_PER_INSTANCE: usize = 16;

pub const HEALTH_CHECK_SLOT_NAME: &str = "healthCheck";

/// A participant of the chain: an instance breaker or health detection.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub name: &'static str,
    pub request_after_half_open: u32,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    status: CircuitBreakerStatus,
    /// 1-based slot index.
    owner: usize,
}

#[derive(Debug, Default)]
struct ChainState {
    entries: HashMap<String, Entry>,
    records: HashMap<String, VecDeque<CircuitChangeRecord>>,
    change_seq: u64,
    version: u64,
    published_version: u64,
}

#[derive(Debug)]
pub struct ChainData {
    service_key: ServiceKey,
    slots: Vec<SlotInfo>,
    clock: Arc<dyn Clock>,
    state: Mutex<ChainState>,
}

/// A breaker's view of the chain data: transitions are made on its behalf.
#[derive(Debug, Clone, Copy)]
pub struct StatusHandle<'a> {
    data: &'a ChainData,
    owner: usize,
    auto_half_open: bool,
}

impl<'a> StatusHandle<'a> {
    pub fn translate(&self, instance_id: &str, from: CircuitBreakerStatus, to: CircuitBreakerStatus) -> bool {
        self.data.translate(self.owner, instance_id, from, to)
    }

    /// Whether the breaker may move Open instances to half open after its
    /// sleep window. Off when health detection does that instead.
    pub fn auto_half_open_enabled(&self) -> bool {
        self.auto_half_open
    }

    pub fn now_ms(&self) -> u64 {
        self.data.clock.now_ms()
    }
}

impl ChainData {
    /// `slots[i]` owns slot index `i + 1`.
    pub fn new(service_key: ServiceKey, slots: Vec<SlotInfo>, clock: Arc<dyn Clock>) -> Self {
        Self {
            service_key,
            slots,
            clock,
            state: Mutex::new(ChainState::default()),
        }
    }

    pub fn service_key(&self) -> &ServiceKey {
        &self.service_key
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn handle(&self, owner: usize, auto_half_open: bool) -> StatusHandle<'_> {
        StatusHandle {
            data: self,
            owner,
            auto_half_open,
        }
    }

    /// Move `instance_id` from `from` to `to` for slot `owner`.
    ///
    /// Rejected when another slot holds the instance, when the current
    /// status is not `from`, or when nothing would change.
    pub fn translate(&self, owner: usize, instance_id: &str, from: CircuitBreakerStatus, to: CircuitBreakerStatus) -> bool {
        if from == to {
            return false;
        }
        let now = self.clock.now_ms();
        let seq = {
            let mut state = self.state.lock();
            let (status, holder) = state
                .entries
                .get(instance_id)
                .map(|e| (e.status, e.owner))
                .unwrap_or((CircuitBreakerStatus::Close, 0));
            if (holder != 0 && holder != owner) || status != from {
                return false;
            }
            state.change_seq += 1;
            state.version += 1;
            let seq = state.change_seq;
            let record = CircuitChangeRecord {
                change_time_ms: now,
                change_seq: seq,
                from,
                to,
                reason: self.slot_name(owner).to_string(),
            };
            let history = state.records.entry(instance_id.to_string()).or_default();
            if history.len() == MAX_RECORDS_PER_INSTANCE {
                history.pop_front();
            }
            history.push_back(record);
            if to == CircuitBreakerStatus::Close {
                state.entries.remove(instance_id);
            } else {
                state.entries.insert(instance_id.to_string(), Entry { status: to, owner });
            }
            seq
        };
        metrics::record_breaker_transition("instance", from, to);
        tracing::info!(
            service = %self.service_key,
            instance = instance_id,
            from = %from,
            to = %to,
            breaker = self.slot_name(owner),
            change_seq = seq,
            "Circuit breaker status changed"
        );
        true
    }

    fn slot_name(&self, owner: usize) -> &'static str {
        owner
            .checked_sub(1)
            .and_then(|i| self.slots.get(i))
            .map(|s| s.name)
            .unwrap_or("unknown")
    }

    pub fn status(&self, instance_id: &str) -> CircuitBreakerStatus {
        self.state
            .lock()
            .entries
            .get(instance_id)
            .map(|e| e.status)
            .unwrap_or_default()
    }

    /// Name of the slot holding the instance, if any.
    pub fn owner_of(&self, instance_id: &str) -> Option<&'static str> {
        let owner = self.state.lock().entries.get(instance_id).map(|e| e.owner)?;
        Some(self.slot_name(owner))
    }

    /// Instances currently in `status`.
    pub fn instances_in(&self, status: CircuitBreakerStatus) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Audit trail of one instance, oldest first.
    pub fn records(&self, instance_id: &str) -> Vec<CircuitChangeRecord> {
        self.state
            .lock()
            .records
            .get(instance_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget the audit trail of instances that left the service.
    pub fn retain_records(&self, exists: &dyn Fn(&str) -> bool) {
        let mut state = self.state.lock();
        let ChainState { entries, records, .. } = &mut *state;
        records.retain(|id, _| entries.contains_key(id) || exists(id));
    }

    /// Publish to `service` when the version moved since the last publish.
    pub fn check_and_sync(&self, service: &Service) -> bool {
        let data = {
            let mut state = self.state.lock();
            if state.version == state.published_version {
                return false;
            }
            state.published_version = state.version;
            let mut open_instances = HashSet::new();
            let mut half_open_instances = HashMap::new();
            for (id, entry) in &state.entries {
                match entry.status {
                    CircuitBreakerStatus::Open => {
                        open_instances.insert(id.clone());
                    }
                    CircuitBreakerStatus::HalfOpen => {
                        let quota = entry
                            .owner
                            .checked_sub(1)
                            .and_then(|i| self.slots.get(i))
                            .map(|s| s.request_after_half_open)
                            .unwrap_or(0);
                        half_open_instances.insert(id.clone(), quota);
                    }
                    _ => {}
                }
            }
            CircuitBreakerData {
                version: state.version,
                open_instances,
                half_open_instances,
            }
        };
        let version = data.version;
        let published = service.set_circuit_breaker_data(data);
        tracing::debug!(service = %self.service_key, version, published, "Circuit breaker data synced");
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use CircuitBreakerStatus::*;

    fn chain_data() -> ChainData {
        ChainData::new(
            ServiceKey::new("Test", "svc"),
            vec![
                SlotInfo {
                    name: "errorCount",
                    request_after_half_open: 10,
                },
                SlotInfo {
                    name: "errorRate",
                    request_after_half_open: 5,
                },
            ],
            Arc::new(ManualClock::new(1_000)),
        )
    }

    #[test]
    fn test_owner_blocks_other_breakers() {
        let data = chain_data();
        assert!(data.translate(1, "a", Close, Open));
        assert!(!data.translate(2, "a", Open, HalfOpen));
        assert!(!data.translate(2, "a", Close, Open));
        assert_eq!(data.owner_of("a"), Some("errorCount"));
        assert!(data.translate(1, "a", Open, HalfOpen));
        assert!(data.translate(1, "a", HalfOpen, Close));
        assert_eq!(data.status("a"), Close);
        assert_eq!(data.owner_of("a"), None);
        // released: another breaker may take it now
        assert!(data.translate(2, "a", Close, Open));
    }

    #[test]
    fn test_wrong_from_or_noop_is_rejected() {
        let data = chain_data();
        assert!(!data.translate(1, "a", Open, HalfOpen));
        assert!(!data.translate(1, "a", Close, Close));
        assert_eq!(data.version(), 0);
    }

    #[test]
    fn test_records_are_sequenced() {
        let data = chain_data();
        data.translate(1, "a", Close, Open);
        data.translate(1, "b", Close, Open);
        data.translate(1, "a", Open, HalfOpen);
        let records = data.records("a");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].change_seq, 1);
        assert_eq!(records[1].change_seq, 3);
        assert_eq!(records[1].reason, "errorCount");
        assert_eq!(records[1].change_time_ms, 1_000);
    }

    #[test]
    fn test_sync_publishes_once_per_version() {
        let data = chain_data();
        let service = Service::new(ServiceKey::new("Test", "svc"));
        data.translate(1, "a", Close, Open);
        data.translate(2, "b", Close, Open);
        data.translate(2, "b", Open, HalfOpen);
        assert!(data.check_and_sync(&service));
        assert!(!data.check_and_sync(&service));

        let published = service.circuit_breaker_data();
        assert_eq!(published.version, 3);
        assert!(published.open_instances.contains("a"));
        assert_eq!(published.half_open_instances.get("b"), Some(&5));
    }
}
