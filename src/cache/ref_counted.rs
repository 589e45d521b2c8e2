//! Reference-counted get-or-create cache.
//!
//! # Responsibilities
//! - Lock-free lookups of published values
//! - At most one concurrent build per key; other callers wait and reuse it
//! - Idle sweep that never drops a value someone still holds

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::observability::metrics;
use crate::time::Clock;

#[derive(Debug)]
struct CacheSlot<V> {
    value: ArcSwapOption<V>,
    build_lock: Mutex<()>,
    last_access_ms: AtomicU64,
}

impl<V> CacheSlot<V> {
    fn new(now_ms: u64) -> Self {
        Self {
            value: ArcSwapOption::empty(),
            build_lock: Mutex::new(()),
            last_access_ms: AtomicU64::new(now_ms),
        }
    }

    fn touch(&self, now_ms: u64) {
        self.last_access_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// Cache whose values are handed out as `Arc<V>`.
///
/// A value stays alive for as long as any caller holds its `Arc`, even after
/// the cache dropped or replaced it.
#[derive(Debug)]
pub struct RefCountedCache<K, V>
where
    K: Eq + Hash,
{
    name: &'static str,
    entries: DashMap<K, Arc<CacheSlot<V>>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> RefCountedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(name: &'static str, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn slot(&self, key: &K) -> Option<Arc<CacheSlot<V>>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Current value for `key`, refreshing its access time.
    pub fn get_with_ref(&self, key: &K) -> Option<Arc<V>> {
        let slot = self.slot(key)?;
        let value = slot.value.load_full()?;
        slot.touch(self.clock.now_ms());
        Some(value)
    }

    /// Publish `value` under `key`, replacing any previous one.
    pub fn put_with_ref(&self, key: K, value: V) -> Arc<V> {
        let now = self.clock.now_ms();
        let value = Arc::new(value);
        let slot = self
            .entries
            .entry(key)
            .or_insert_with(|| Arc::new(CacheSlot::new(now)))
            .clone();
        slot.value.store(Some(value.clone()));
        slot.touch(now);
        metrics::record_cache_entries(self.name, self.entries.len());
        value
    }

    /// Return the value for `key`, building it with `builder` if absent.
    ///
    /// Concurrent callers for the same key serialize on that key only; the
    /// first runs `builder`, the rest reuse its result. A failed build leaves
    /// the key empty so the next caller retries. A slot swept between the
    /// lookup and the build is abandoned for the current one.
    pub fn try_create_or_get<E, F>(&self, key: &K, builder: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(value) = self.get_with_ref(key) {
            return Ok(value);
        }
        loop {
            let now = self.clock.now_ms();
            let slot = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CacheSlot::new(now)))
                .clone();

            let _building = slot.build_lock.lock();
            if let Some(value) = slot.value.load_full() {
                slot.touch(now);
                return Ok(value);
            }
            if !self.is_current(key, &slot) {
                tracing::trace!(cache = self.name, "Cache slot swept before build, retrying");
                continue;
            }
            let value = Arc::new(builder()?);
            slot.value.store(Some(value.clone()));
            slot.touch(now);
            tracing::trace!(cache = self.name, "Cache entry built");
            metrics::record_cache_entries(self.name, self.entries.len());
            return Ok(value);
        }
    }

    /// Whether `slot` is still the one published under `key`.
    fn is_current(&self, key: &K, slot: &Arc<CacheSlot<V>>) -> bool {
        self.entries
            .get(key)
            .map(|entry| Arc::ptr_eq(entry.value(), slot))
            .unwrap_or(false)
    }

    /// Infallible form of [`Self::try_create_or_get`].
    pub fn create_or_get<F>(&self, key: &K, builder: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        match self.try_create_or_get::<std::convert::Infallible, _>(key, || Ok(builder())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.entries.remove(key).and_then(|(_, slot)| slot.value.load_full())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All published values.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries
            .iter()
            .filter_map(|entry| entry.value().value.load_full())
            .collect()
    }

    /// Drop entries idle for longer than `idle_ms` that nobody else holds.
    /// Returns how many were dropped.
    pub fn sweep_idle(&self, idle_ms: u64) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, slot| {
            let idle = now.saturating_sub(slot.last_access_ms.load(Ordering::Relaxed));
            if idle <= idle_ms {
                return true;
            }
            match slot.value.load_full() {
                // one count in the slot plus the one we just took
                Some(value) => Arc::strong_count(&value) > 2,
                None => slot.build_lock.is_locked(),
            }
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(cache = self.name, removed, remaining = self.entries.len(), "Idle cache entries swept");
            metrics::record_cache_entries(self.name, self.entries.len());
        }
        removed
    }
}

/// A cache the background sweeper can clean.
pub trait Sweepable: Send + Sync {
    fn cache_name(&self) -> &'static str;
    fn sweep(&self, idle_ms: u64) -> usize;
}

impl<K, V> Sweepable for RefCountedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Send + Sync,
{
    fn cache_name(&self) -> &'static str {
        self.name
    }

    fn sweep(&self, idle_ms: u64) -> usize {
        self.sweep_idle(idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn cache(clock: Arc<ManualClock>) -> RefCountedCache<u64, String> {
        RefCountedCache::new("test", clock)
    }

    #[test]
    fn test_put_and_get() {
        let c = cache(Arc::new(ManualClock::new(0)));
        assert!(c.get_with_ref(&1).is_none());
        c.put_with_ref(1, "one".to_string());
        assert_eq!(c.get_with_ref(&1).unwrap().as_str(), "one");
        c.put_with_ref(1, "uno".to_string());
        assert_eq!(c.get_with_ref(&1).unwrap().as_str(), "uno");
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_builder_runs_once_under_contention() {
        let c = Arc::new(cache(Arc::new(ManualClock::new(0))));
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                let builds = builds.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    c.create_or_get(&7, || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        "built".to_string()
                    })
                })
            })
            .collect();
        let values: Vec<Arc<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[test]
    fn test_failed_build_is_retried() {
        let c = cache(Arc::new(ManualClock::new(0)));
        let first: Result<Arc<String>, &str> = c.try_create_or_get(&1, || Err("boom"));
        assert!(first.is_err());
        let second: Result<Arc<String>, &str> = c.try_create_or_get(&1, || Ok("ok".to_string()));
        assert_eq!(second.unwrap().as_str(), "ok");
    }

    #[test]
    fn test_swept_empty_slot_is_not_built_into() {
        let clock = Arc::new(ManualClock::new(0));
        let c = cache(clock.clone());
        // a caller that missed and is about to build
        let stale = c
            .entries
            .entry(1)
            .or_insert_with(|| Arc::new(CacheSlot::new(0)))
            .clone();
        clock.advance_ms(500);
        assert_eq!(c.sweep_idle(100), 1);
        assert!(!c.is_current(&1, &stale));

        let builds = AtomicUsize::new(0);
        for _ in 0..2 {
            let value = c.create_or_get(&1, || {
                builds.fetch_add(1, Ordering::SeqCst);
                "one".to_string()
            });
            assert_eq!(value.as_str(), "one");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(stale.value.load_full().is_none());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_sweep_keeps_held_and_recent_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let c = cache(clock.clone());
        let held = c.put_with_ref(1, "held".to_string());
        c.put_with_ref(2, "idle".to_string());
        clock.advance_ms(500);
        c.put_with_ref(3, "recent".to_string());

        assert_eq!(c.sweep_idle(100), 1);
        assert!(c.get_with_ref(&1).is_some());
        assert!(c.get_with_ref(&2).is_none());
        assert!(c.get_with_ref(&3).is_some());
        drop(held);
    }
}
