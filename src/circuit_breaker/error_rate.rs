//! Sliding-window error-rate instance breaker.
//!
//! Calls land in time buckets; a bucket left over from an earlier round is
//! reset by whichever caller first claims it. All transitions happen in the
//! timing pass: the real-time path only counts.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::circuit_breaker::chain_data::StatusHandle;
use crate::circuit_breaker::error_count::HALF_OPEN_STALL_WINDOWS;
use crate::config::schema::ErrorRateConfig;
use crate::model::CircuitBreakerStatus;
use crate::time::Clock;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorRateSettings {
    pub request_volume_threshold: u32,
    pub error_rate_threshold: f64,
    pub num_buckets: u32,
    pub bucket_ms: u64,
    pub sleep_window_ms: u64,
    pub request_after_half_open: u32,
    pub success_after_half_open: u32,
    pub metric_expired_ms: u64,
}

fn positive_or(value: i64, default: i64, field: &'static str) -> u32 {
    if value > 0 {
        value.min(u32::MAX as i64) as u32
    } else {
        tracing::warn!(field, value, default, "Invalid error rate setting, using default");
        default as u32
    }
}

fn millis_or(value: Duration, default: Duration) -> u64 {
    if value.is_zero() {
        default.as_millis() as u64
    } else {
        value.as_millis() as u64
    }
}

impl ErrorRateSettings {
    pub fn from_config(config: &ErrorRateConfig) -> Self {
        let defaults = ErrorRateConfig::default();
        let error_rate_threshold = if config.error_rate_threshold > 0.0 && config.error_rate_threshold < 1.0 {
            config.error_rate_threshold
        } else {
            tracing::warn!(
                value = config.error_rate_threshold,
                default = defaults.error_rate_threshold,
                "Invalid errorRateThreshold, using default"
            );
            defaults.error_rate_threshold
        };
        let window_ms = millis_or(config.metric_stat_time_window, defaults.metric_stat_time_window);
        let num_buckets = positive_or(config.metric_num_buckets, defaults.metric_num_buckets, "metricNumBuckets");
        let request = positive_or(
            config.request_count_after_half_open,
            defaults.request_count_after_half_open,
            "requestCountAfterHalfOpen",
        );
        let success = positive_or(
            config.success_count_after_half_open,
            defaults.success_count_after_half_open,
            "successCountAfterHalfOpen",
        )
        .min(request);
        Self {
            request_volume_threshold: positive_or(
                config.request_volume_threshold,
                defaults.request_volume_threshold,
                "requestVolumeThreshold",
            ),
            error_rate_threshold,
            num_buckets,
            bucket_ms: window_ms.div_ceil(num_buckets as u64).max(1),
            sleep_window_ms: millis_or(config.sleep_window, defaults.sleep_window),
            request_after_half_open: request,
            success_after_half_open: success,
            metric_expired_ms: millis_or(config.metric_expired_time, defaults.metric_expired_time),
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    /// Bucket epoch plus one; zero marks an empty bucket.
    epoch: AtomicU64,
    total: AtomicU32,
    errors: AtomicU32,
}

#[derive(Debug)]
struct ErrorRateStatus {
    status: AtomicU8,
    half_open_total: AtomicU32,
    half_open_errors: AtomicU32,
    last_update_ms: AtomicU64,
    last_access_ms: AtomicU64,
    buckets: Vec<Bucket>,
}

impl ErrorRateStatus {
    fn new(num_buckets: u32, now_ms: u64) -> Self {
        Self {
            status: AtomicU8::new(CircuitBreakerStatus::Close as u8),
            half_open_total: AtomicU32::new(0),
            half_open_errors: AtomicU32::new(0),
            last_update_ms: AtomicU64::new(now_ms),
            last_access_ms: AtomicU64::new(now_ms),
            buckets: (0..num_buckets).map(|_| Bucket::default()).collect(),
        }
    }

    fn status(&self) -> CircuitBreakerStatus {
        CircuitBreakerStatus::from(self.status.load(Ordering::Acquire))
    }

    fn set(&self, status: CircuitBreakerStatus, now_ms: u64) {
        self.status.store(status as u8, Ordering::Release);
        self.last_update_ms.store(now_ms, Ordering::Release);
    }

    fn clear_buckets(&self) {
        for bucket in &self.buckets {
            bucket.epoch.store(0, Ordering::Release);
        }
    }

    fn enter_half_open(&self, now_ms: u64) {
        self.half_open_total.store(0, Ordering::Relaxed);
        self.half_open_errors.store(0, Ordering::Relaxed);
        self.clear_buckets();
        self.set(CircuitBreakerStatus::HalfOpen, now_ms);
    }

    /// Totals of buckets newer than `oldest_epoch`.
    fn count(&self, oldest_epoch: u64) -> (u32, u32) {
        self.buckets
            .iter()
            .filter(|b| b.epoch.load(Ordering::Acquire) > oldest_epoch)
            .fold((0, 0), |(total, errors), b| {
                (
                    total + b.total.load(Ordering::Relaxed),
                    errors + b.errors.load(Ordering::Relaxed),
                )
            })
    }
}

#[derive(Debug)]
pub struct ErrorRateBreaker {
    settings: ErrorRateSettings,
    statuses: DashMap<String, Arc<ErrorRateStatus>>,
    clock: Arc<dyn Clock>,
}

impl ErrorRateBreaker {
    pub fn new(config: &ErrorRateConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings: ErrorRateSettings::from_config(config),
            statuses: DashMap::new(),
            clock,
        }
    }

    pub fn settings(&self) -> &ErrorRateSettings {
        &self.settings
    }

    pub fn request_after_half_open(&self) -> u32 {
        self.settings.request_after_half_open
    }

    fn get_or_create(&self, instance_id: &str, now_ms: u64) -> Arc<ErrorRateStatus> {
        if let Some(status) = self.statuses.get(instance_id) {
            status.last_access_ms.store(now_ms, Ordering::Relaxed);
            return status.clone();
        }
        self.statuses
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(ErrorRateStatus::new(self.settings.num_buckets, now_ms)))
            .clone()
    }

    pub fn realtime(&self, instance_id: &str, success: bool) {
        let now = self.clock.now_ms();
        let status = self.get_or_create(instance_id, now);
        if status.status() == CircuitBreakerStatus::HalfOpen {
            status.half_open_total.fetch_add(1, Ordering::Relaxed);
            if !success {
                status.half_open_errors.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let epoch = now / self.settings.bucket_ms + 1;
        let bucket = &status.buckets[(epoch % self.settings.num_buckets as u64) as usize];
        let stored = bucket.epoch.load(Ordering::Acquire);
        if stored != epoch
            && bucket
                .epoch
                .compare_exchange(stored, epoch, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            bucket.total.store(0, Ordering::Relaxed);
            bucket.errors.store(0, Ordering::Relaxed);
        }
        bucket.total.fetch_add(1, Ordering::Relaxed);
        if !success {
            bucket.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn timing(&self, handle: &StatusHandle<'_>) {
        let now = self.clock.now_ms();
        let oldest_epoch = (now / self.settings.bucket_ms + 1).saturating_sub(self.settings.num_buckets as u64);
        let entries: Vec<(String, Arc<ErrorRateStatus>)> =
            self.statuses.iter().map(|e| (e.key().clone(), e.value().clone())).collect();

        for (instance_id, status) in entries {
            let last_update = status.last_update_ms.load(Ordering::Acquire);
            match status.status() {
                CircuitBreakerStatus::Open => {
                    if handle.auto_half_open_enabled()
                        && last_update + self.settings.sleep_window_ms <= now
                        && handle.translate(&instance_id, CircuitBreakerStatus::Open, CircuitBreakerStatus::HalfOpen)
                    {
                        status.enter_half_open(now);
                    }
                }
                CircuitBreakerStatus::Close => {
                    let (total, errors) = status.count(oldest_epoch);
                    if total >= self.settings.request_volume_threshold
                        && errors as f64 / total as f64 >= self.settings.error_rate_threshold
                        && handle.translate(&instance_id, CircuitBreakerStatus::Close, CircuitBreakerStatus::Open)
                    {
                        tracing::debug!(instance = %instance_id, total, errors, "Error rate reached threshold");
                        status.set(CircuitBreakerStatus::Open, now);
                    }
                }
                CircuitBreakerStatus::HalfOpen => {
                    let total = status.half_open_total.load(Ordering::Relaxed);
                    let errors = status.half_open_errors.load(Ordering::Relaxed);
                    let tolerated = self.settings.request_after_half_open - self.settings.success_after_half_open;
                    if total.saturating_sub(errors) >= self.settings.success_after_half_open {
                        if handle.translate(&instance_id, CircuitBreakerStatus::HalfOpen, CircuitBreakerStatus::Close) {
                            status.clear_buckets();
                            status.set(CircuitBreakerStatus::Close, now);
                        }
                    } else if (errors > tolerated
                        || last_update + HALF_OPEN_STALL_WINDOWS * self.settings.sleep_window_ms <= now)
                        && handle.translate(&instance_id, CircuitBreakerStatus::HalfOpen, CircuitBreakerStatus::Open)
                    {
                        status.clear_buckets();
                        status.set(CircuitBreakerStatus::Open, now);
                    }
                }
                CircuitBreakerStatus::Preserved => {}
            }
        }
    }

    pub fn detect_to_half_open(&self, instance_id: &str) {
        if let Some(status) = self.statuses.get(instance_id) {
            if status.status() == CircuitBreakerStatus::Open {
                status.enter_half_open(self.clock.now_ms());
            }
        }
    }

    /// Drop the record of an instance health detection closed.
    pub fn detect_to_close(&self, instance_id: &str) {
        self.statuses.remove(instance_id);
    }

    pub fn clean_status(&self, handle: &StatusHandle<'_>, exists: &dyn Fn(&str) -> bool) {
        let now = self.clock.now_ms();
        let expired: Vec<String> = self
            .statuses
            .iter()
            .filter(|e| e.value().last_access_ms.load(Ordering::Relaxed) + self.settings.metric_expired_ms <= now)
            .map(|e| e.key().clone())
            .filter(|id| !exists(id))
            .collect();
        for instance_id in expired {
            handle.translate(&instance_id, CircuitBreakerStatus::Open, CircuitBreakerStatus::Close);
            handle.translate(&instance_id, CircuitBreakerStatus::HalfOpen, CircuitBreakerStatus::Close);
            self.statuses.remove(&instance_id);
        }
    }

    pub fn tracked(&self) -> usize {
        self.statuses.len()
    }
}
