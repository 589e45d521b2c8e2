//! Background sweep of idle cache entries.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time;

use crate::cache::Sweepable;

/// Periodically drops idle entries from every registered cache.
#[derive(Default)]
pub struct CacheSweeper {
    caches: RwLock<Vec<Arc<dyn Sweepable>>>,
}

impl CacheSweeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cache: Arc<dyn Sweepable>) {
        tracing::debug!(cache = cache.cache_name(), "Cache registered for sweeping");
        self.caches.write().push(cache);
    }

    /// One pass over every cache. Returns the number of dropped entries.
    pub fn sweep_once(&self, idle: Duration) -> usize {
        let idle_ms = idle.as_millis() as u64;
        self.caches.read().iter().map(|cache| cache.sweep(idle_ms)).sum()
    }

    pub async fn run(self: Arc<Self>, idle: Duration, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(idle_ms = idle.as_millis() as u64, "Cache sweeper starting");
        let mut ticker = time::interval(idle.max(Duration::from_millis(100)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep_once(idle);
                    if removed > 0 {
                        tracing::debug!(removed, "Cache sweep finished");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Cache sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RefCountedCache;
    use crate::time::ManualClock;

    #[test]
    fn test_sweep_once_covers_all_caches() {
        let clock = Arc::new(ManualClock::new(0));
        let a: Arc<RefCountedCache<u32, u32>> = Arc::new(RefCountedCache::new("a", clock.clone()));
        let b: Arc<RefCountedCache<u32, u32>> = Arc::new(RefCountedCache::new("b", clock.clone()));
        a.put_with_ref(1, 1);
        b.put_with_ref(1, 1);
        b.put_with_ref(2, 2);

        let sweeper = CacheSweeper::new();
        sweeper.register(a.clone());
        sweeper.register(b.clone());
        assert_eq!(sweeper.sweep_once(Duration::from_secs(1)), 0);
        clock.advance_ms(2_000);
        assert_eq!(sweeper.sweep_once(Duration::from_secs(1)), 3);
        assert!(a.is_empty() && b.is_empty());
    }
}
