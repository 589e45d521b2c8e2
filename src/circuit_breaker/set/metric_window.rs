//! Local metric windows of the set breaker, one per `subset#labels` key.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::circuit_breaker::set::backend::{MetricCounts, MetricKey};
use crate::model::breaker_rule::DestinationSet;
use crate::model::circuit_breaker::map_to_key;
use crate::model::{CallResult, CallRetStatus, ServiceKey};

/// Buckets beyond one report interval, covering late reporting.
const SPARE_BUCKETS: u64 = 3;

/// How one call counts toward a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Error,
    Slow,
    /// Index into the destination's special error policies.
    SpecificError(usize),
}

/// Classify a call against the destination's policies. Timeouts are not
/// counted.
pub fn classify(dst: &DestinationSet, result: &CallResult) -> Option<CallOutcome> {
    let error_rate = &dst.policy.error_rate;
    let slow_rate = &dst.policy.slow_rate;
    match result.ret_status {
        CallRetStatus::Timeout => None,
        CallRetStatus::Ok => {
            if slow_rate.enable && result.delay_ms >= slow_rate.max_rt_ms {
                Some(CallOutcome::Slow)
            } else {
                Some(CallOutcome::Success)
            }
        }
        CallRetStatus::Error => {
            if !error_rate.enable {
                return Some(CallOutcome::Success);
            }
            let special = error_rate
                .specials
                .iter()
                .position(|s| s.error_codes.contains(&result.ret_code));
            Some(special.map(CallOutcome::SpecificError).unwrap_or(CallOutcome::Error))
        }
    }
}

#[derive(Debug, Default)]
struct LocalBucket {
    /// Bucket epoch + 1; 0 for a bucket never written.
    epoch: u64,
    counts: MetricCounts,
}

/// Counts for one key between two reports.
#[derive(Debug)]
pub struct MetricWindow {
    key: MetricKey,
    window_key: String,
    subset_key: String,
    destination: DestinationSet,
    rule_revision: String,
    bucket_ms: u64,
    buckets: Vec<Mutex<LocalBucket>>,
    initialized: AtomicBool,
    deleted: AtomicBool,
    next_report_ms: AtomicU64,
    last_access_ms: AtomicU64,
}

impl MetricWindow {
    pub fn new(
        service_key: ServiceKey,
        subset: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
        destination: DestinationSet,
        rule_revision: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        let precision = destination.metric_precision.max(1) as u64;
        let bucket_ms = (destination.metric_window_ms / precision).max(1);
        let bucket_count = destination.update_interval_ms / bucket_ms + SPARE_BUCKETS;
        let subset_key = map_to_key(subset);
        let labels_key = map_to_key(labels);
        Self {
            window_key: format!("{}#{}", subset_key, labels_key),
            subset_key: format!("{}#", subset_key),
            key: MetricKey {
                service_key,
                subset: if subset_key.is_empty() { "*".to_string() } else { subset_key },
                labels: if labels_key.is_empty() { "*".to_string() } else { labels_key },
            },
            rule_revision: rule_revision.into(),
            bucket_ms,
            buckets: (0..bucket_count).map(|_| Mutex::new(LocalBucket::default())).collect(),
            initialized: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            next_report_ms: AtomicU64::new(now_ms + destination.update_interval_ms),
            last_access_ms: AtomicU64::new(now_ms),
            destination,
        }
    }

    pub fn key(&self) -> &MetricKey {
        &self.key
    }

    /// `subset#labels`, the key breaker status is kept under.
    pub fn window_key(&self) -> &str {
        &self.window_key
    }

    /// `subset#`, the key breaking every label of the subset.
    pub fn subset_key(&self) -> &str {
        &self.subset_key
    }

    pub fn destination(&self) -> &DestinationSet {
        &self.destination
    }

    pub fn rule_revision(&self) -> &str {
        &self.rule_revision
    }

    pub fn add(&self, outcome: CallOutcome, now_ms: u64) {
        let epoch = now_ms / self.bucket_ms;
        let slot = (epoch % self.buckets.len() as u64) as usize;
        let mut bucket = self.buckets[slot].lock();
        if bucket.epoch != epoch + 1 {
            // a stale bucket still holding counts is merged into the report
            // at drain time, so only reset an already drained one
            if bucket.counts.is_empty() {
                bucket.epoch = epoch + 1;
            }
        }
        let counts = &mut bucket.counts;
        counts.total += 1;
        match outcome {
            CallOutcome::Success => {}
            CallOutcome::Error => counts.errors += 1,
            CallOutcome::Slow => counts.slow += 1,
            CallOutcome::SpecificError(index) => {
                if let Some(special) = self.destination.policy.error_rate.specials.get(index) {
                    *counts.specific.entry(special.name.clone()).or_default() += 1;
                }
            }
        }
        self.last_access_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Take every count accumulated since the last drain.
    pub fn drain(&self) -> MetricCounts {
        let mut total = MetricCounts::default();
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            total.merge(&bucket.counts);
            *bucket = LocalBucket::default();
        }
        total
    }

    /// Claim the report due at `now_ms`, scheduling the next one.
    pub fn take_report_due(&self, now_ms: u64) -> bool {
        let due = self.next_report_ms.load(Ordering::Acquire);
        if now_ms < due {
            return false;
        }
        self.next_report_ms
            .compare_exchange(due, now_ms + self.destination.update_interval_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    /// Idle time after which the window may be dropped: long enough to see
    /// a full sleep window and one metric window through.
    pub fn idle_expiry_ms(&self) -> u64 {
        2 * (self.destination.recover.sleep_window_ms + self.destination.metric_window_ms)
    }
}

/// Windows of one service keyed by `subset#labels`.
#[derive(Debug, Default)]
pub struct MetricWindowManager {
    windows: DashMap<String, Arc<MetricWindow>>,
}

impl MetricWindowManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Window for the key, rebuilt when the rule revision changed.
    ///
    /// The replaced window is marked deleted; its undrained counts are lost.
    pub fn get_or_update(
        &self,
        service_key: &ServiceKey,
        subset: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
        destination: &DestinationSet,
        rule_revision: &str,
        now_ms: u64,
    ) -> Arc<MetricWindow> {
        let window_key = format!("{}#{}", map_to_key(subset), map_to_key(labels));
        if let Some(window) = self.windows.get(&window_key) {
            if window.rule_revision() == rule_revision && !window.is_deleted() {
                return window.clone();
            }
        }
        let mut entry = self.windows.entry(window_key).or_insert_with(|| {
            Arc::new(MetricWindow::new(
                service_key.clone(),
                subset,
                labels,
                destination.clone(),
                rule_revision,
                now_ms,
            ))
        });
        if entry.rule_revision() != rule_revision || entry.is_deleted() {
            entry.mark_deleted();
            tracing::debug!(
                service = %service_key,
                window = entry.window_key(),
                revision = rule_revision,
                "Rebuilding metric window for new breaker rule"
            );
            *entry = Arc::new(MetricWindow::new(
                service_key.clone(),
                subset,
                labels,
                destination.clone(),
                rule_revision,
                now_ms,
            ));
        }
        entry.clone()
    }

    pub fn get(&self, window_key: &str) -> Option<Arc<MetricWindow>> {
        self.windows.get(window_key).map(|w| w.clone())
    }

    pub fn windows(&self) -> Vec<Arc<MetricWindow>> {
        self.windows.iter().map(|w| w.value().clone()).collect()
    }

    /// Mark idle windows not held by `keep` as deleted, then drop every
    /// deleted window.
    pub fn gc(&self, now_ms: u64, keep: &dyn Fn(&MetricWindow) -> bool) -> usize {
        for window in self.windows.iter() {
            if now_ms.saturating_sub(window.last_access_ms()) >= window.idle_expiry_ms() && !keep(window.value()) {
                window.mark_deleted();
            }
        }
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_deleted());
        before - self.windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::breaker_rule::SpecialErrorPolicy;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn destination() -> DestinationSet {
        let mut dst = DestinationSet::default();
        dst.policy.slow_rate.enable = true;
        dst.policy.slow_rate.max_rt_ms = 500;
        dst.policy.error_rate.specials.push(SpecialErrorPolicy {
            name: "throttled".into(),
            error_codes: vec![429],
            error_rate_to_open: 30,
            error_rate_to_preserved: 10,
        });
        dst
    }

    fn call(status: CallRetStatus, code: i64, delay_ms: u64) -> CallResult {
        let mut result = CallResult::new(ServiceKey::new("Test", "svc"), "i1", status);
        result.ret_code = code;
        result.delay_ms = delay_ms;
        result
    }

    #[test]
    fn test_classify() {
        let dst = destination();
        assert_eq!(classify(&dst, &call(CallRetStatus::Ok, 0, 10)), Some(CallOutcome::Success));
        assert_eq!(classify(&dst, &call(CallRetStatus::Ok, 0, 500)), Some(CallOutcome::Slow));
        assert_eq!(classify(&dst, &call(CallRetStatus::Error, 500, 10)), Some(CallOutcome::Error));
        assert_eq!(classify(&dst, &call(CallRetStatus::Error, 429, 10)), Some(CallOutcome::SpecificError(0)));
        assert_eq!(classify(&dst, &call(CallRetStatus::Timeout, 0, 10)), None);

        let mut no_errors = dst.clone();
        no_errors.policy.error_rate.enable = false;
        assert_eq!(classify(&no_errors, &call(CallRetStatus::Error, 500, 10)), Some(CallOutcome::Success));
    }

    #[test]
    fn test_window_counts_and_drain() {
        let window = MetricWindow::new(
            ServiceKey::new("Test", "svc"),
            &map(&[("set", "s1")]),
            &BTreeMap::new(),
            destination(),
            "r1",
            0,
        );
        assert_eq!(window.window_key(), "set:s1#");
        assert_eq!(window.subset_key(), "set:s1#");
        assert_eq!(window.key().labels, "*");

        window.add(CallOutcome::Success, 100);
        window.add(CallOutcome::Error, 6_000);
        window.add(CallOutcome::SpecificError(0), 6_100);
        window.add(CallOutcome::Slow, 9_000);
        let counts = window.drain();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.errors, 1);
        assert_eq!(counts.slow, 1);
        assert_eq!(counts.specific.get("throttled"), Some(&1));
        assert!(window.drain().is_empty());
    }

    #[test]
    fn test_report_schedule() {
        let window = MetricWindow::new(ServiceKey::new("Test", "svc"), &BTreeMap::new(), &BTreeMap::new(), destination(), "r1", 0);
        assert!(!window.take_report_due(4_999));
        assert!(window.take_report_due(5_000));
        assert!(!window.take_report_due(5_000));
        assert!(window.take_report_due(10_000));
    }

    #[test]
    fn test_revision_change_rebuilds_window() {
        let manager = MetricWindowManager::new();
        let key = ServiceKey::new("Test", "svc");
        let subset = map(&[("set", "s1")]);
        let labels = map(&[("method", "Get")]);
        let first = manager.get_or_update(&key, &subset, &labels, &destination(), "r1", 0);
        let same = manager.get_or_update(&key, &subset, &labels, &destination(), "r1", 10);
        assert!(Arc::ptr_eq(&first, &same));

        let rebuilt = manager.get_or_update(&key, &subset, &labels, &destination(), "r2", 20);
        assert!(first.is_deleted());
        assert_eq!(rebuilt.rule_revision(), "r2");
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_gc_drops_idle_windows() {
        let manager = MetricWindowManager::new();
        let key = ServiceKey::new("Test", "svc");
        let busy = manager.get_or_update(&key, &map(&[("set", "s1")]), &BTreeMap::new(), &destination(), "r1", 0);
        manager.get_or_update(&key, &map(&[("set", "s2")]), &BTreeMap::new(), &destination(), "r1", 0);
        let held = manager.get_or_update(&key, &map(&[("set", "s3")]), &BTreeMap::new(), &destination(), "r1", 0);
        // default expiry: 2 * (600s + 60s)
        let now = 1_320_000;
        busy.add(CallOutcome::Success, now - 1_000);
        assert_eq!(manager.gc(now, &|w| w.window_key() == held.window_key()), 1);
        assert!(manager.get("set:s1#").is_some());
        assert!(manager.get("set:s2#").is_none());
        assert!(manager.get("set:s3#").is_some());
    }
}
