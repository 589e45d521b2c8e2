//! Consecutive-error instance breaker.
//!
//! # Responsibilities
//! - Open an instance after `continuousErrorThreshold` errors in a row
//! - Move it to half open once the sleep window passed (timing pass)
//! - Close it when enough half-open trials succeeded, reopen it on failure
//!
//! A success outside half open resets the streak.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::circuit_breaker::chain_data::StatusHandle;
use crate::config::schema::ErrorCountConfig;
use crate::model::CircuitBreakerStatus;
use crate::time::Clock;

/// A half-open instance that makes no progress for this many sleep windows
/// is opened again.
pub const HALF_OPEN_STALL_WINDOWS: u64 = 100;

/// Thresholds after falling back from invalid values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCountSettings {
    pub continuous_error_threshold: u32,
    pub sleep_window_ms: u64,
    pub request_after_half_open: u32,
    pub success_after_half_open: u32,
    /// Errors tolerated while half open before reopening.
    pub error_half_open_to_open: u32,
    pub metric_expired_ms: u64,
}

fn positive_or(value: i64, default: i64, field: &'static str) -> u32 {
    if value > 0 {
        value.min(u32::MAX as i64) as u32
    } else {
        tracing::warn!(field, value, default, "Invalid error count setting, using default");
        default as u32
    }
}

fn duration_or(value: Duration, default: Duration, field: &'static str) -> u64 {
    if value.is_zero() {
        tracing::warn!(field, default_ms = default.as_millis() as u64, "Invalid error count setting, using default");
        default.as_millis() as u64
    } else {
        value.as_millis() as u64
    }
}

impl ErrorCountSettings {
    pub fn from_config(config: &ErrorCountConfig) -> Self {
        let defaults = ErrorCountConfig::default();
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
        let tolerated = request - success + 1;
        let error_half_open_to_open = match config.error_count_after_half_open {
            Some(errors) if errors > 0 && errors <= request => errors,
            Some(errors) => {
                tracing::warn!(
                    field = "errorCountAfterHalfOpen",
                    value = errors,
                    default = tolerated,
                    "Invalid error count setting, using default"
                );
                tolerated
            }
            None => tolerated,
        };
        Self {
            continuous_error_threshold: positive_or(
                config.continuous_error_threshold,
                defaults.continuous_error_threshold,
                "continuousErrorThreshold",
            ),
            sleep_window_ms: duration_or(config.sleep_window, defaults.sleep_window, "sleepWindow"),
            request_after_half_open: request,
            success_after_half_open: success,
            error_half_open_to_open,
            metric_expired_ms: duration_or(config.metric_expired_time, defaults.metric_expired_time, "metricExpiredTime"),
        }
    }
}

#[derive(Debug)]
struct ErrorCountStatus {
    status: AtomicU8,
    error_count: AtomicU32,
    success_count: AtomicU32,
    last_update_ms: AtomicU64,
    last_access_ms: AtomicU64,
}

impl ErrorCountStatus {
    fn new(now_ms: u64) -> Self {
        Self {
            status: AtomicU8::new(CircuitBreakerStatus::Close as u8),
            error_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_update_ms: AtomicU64::new(now_ms),
            last_access_ms: AtomicU64::new(now_ms),
        }
    }

    fn status(&self) -> CircuitBreakerStatus {
        CircuitBreakerStatus::from(self.status.load(Ordering::Acquire))
    }

    fn set(&self, status: CircuitBreakerStatus, now_ms: u64) {
        self.status.store(status as u8, Ordering::Release);
        self.last_update_ms.store(now_ms, Ordering::Release);
    }

    fn reset_counters(&self) {
        self.error_count.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct ErrorCountBreaker {
    settings: ErrorCountSettings,
    statuses: DashMap<String, Arc<ErrorCountStatus>>,
    clock: Arc<dyn Clock>,
}

impl ErrorCountBreaker {
    pub fn new(config: &ErrorCountConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_settings(ErrorCountSettings::from_config(config), clock)
    }

    pub fn with_settings(settings: ErrorCountSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            statuses: DashMap::new(),
            clock,
        }
    }

    pub fn settings(&self) -> &ErrorCountSettings {
        &self.settings
    }

    pub fn request_after_half_open(&self) -> u32 {
        self.settings.request_after_half_open
    }

    fn get_or_create(&self, instance_id: &str, now_ms: u64) -> Arc<ErrorCountStatus> {
        if let Some(status) = self.statuses.get(instance_id) {
            status.last_access_ms.store(now_ms, Ordering::Relaxed);
            return status.clone();
        }
        self.statuses
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(ErrorCountStatus::new(now_ms)))
            .clone()
    }

    pub fn realtime(&self, instance_id: &str, success: bool, handle: &StatusHandle<'_>) {
        let now = self.clock.now_ms();
        let status = self.get_or_create(instance_id, now);
        if success {
            if status.status() == CircuitBreakerStatus::HalfOpen {
                status.success_count.fetch_add(1, Ordering::Relaxed);
            } else {
                status.error_count.store(0, Ordering::Relaxed);
            }
            return;
        }
        match status.status() {
            CircuitBreakerStatus::Close => {
                let errors = status.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                if errors >= self.settings.continuous_error_threshold
                    && handle.translate(instance_id, CircuitBreakerStatus::Close, CircuitBreakerStatus::Open)
                {
                    status.set(CircuitBreakerStatus::Open, now);
                }
            }
            CircuitBreakerStatus::HalfOpen => {
                let errors = status.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                if errors >= self.settings.error_half_open_to_open
                    && handle.translate(instance_id, CircuitBreakerStatus::HalfOpen, CircuitBreakerStatus::Open)
                {
                    status.set(CircuitBreakerStatus::Open, now);
                }
            }
            _ => {}
        }
    }

    pub fn timing(&self, handle: &StatusHandle<'_>) {
        let now = self.clock.now_ms();
        let entries: Vec<(String, Arc<ErrorCountStatus>)> =
            self.statuses.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        for (instance_id, status) in entries {
            let last_update = status.last_update_ms.load(Ordering::Acquire);
            match status.status() {
                CircuitBreakerStatus::Open => {
                    if handle.auto_half_open_enabled()
                        && last_update + self.settings.sleep_window_ms <= now
                        && handle.translate(&instance_id, CircuitBreakerStatus::Open, CircuitBreakerStatus::HalfOpen)
                    {
                        status.reset_counters();
                        status.set(CircuitBreakerStatus::HalfOpen, now);
                    }
                }
                CircuitBreakerStatus::HalfOpen => {
                    if status.success_count.load(Ordering::Relaxed) >= self.settings.success_after_half_open {
                        if handle.translate(&instance_id, CircuitBreakerStatus::HalfOpen, CircuitBreakerStatus::Close) {
                            status.reset_counters();
                            status.set(CircuitBreakerStatus::Close, now);
                        }
                    } else if last_update + HALF_OPEN_STALL_WINDOWS * self.settings.sleep_window_ms <= now
                        && handle.translate(&instance_id, CircuitBreakerStatus::HalfOpen, CircuitBreakerStatus::Open)
                    {
                        status.set(CircuitBreakerStatus::Open, now);
                    }
                }
                _ => {}
            }
        }
    }

    pub fn detect_to_half_open(&self, instance_id: &str) {
        if let Some(status) = self.statuses.get(instance_id) {
            if status.status() == CircuitBreakerStatus::Open {
                status.reset_counters();
                status.set(CircuitBreakerStatus::HalfOpen, self.clock.now_ms());
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
            tracing::debug!(instance = %instance_id, "Expired error count record removed");
        }
    }

    pub fn tracked(&self) -> usize {
        self.statuses.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::chain_data::{ChainData, SlotInfo};
    use crate::model::ServiceKey;
    use crate::time::ManualClock;
    use CircuitBreakerStatus::*;

    fn setup(threshold: i64, request: i64, success: i64) -> (Arc<ManualClock>, ChainData, ErrorCountBreaker) {
        let clock = Arc::new(ManualClock::new(10_000));
        let config = ErrorCountConfig {
            continuous_error_threshold: threshold,
            sleep_window: Duration::from_secs(5),
            request_count_after_half_open: request,
            success_count_after_half_open: success,
            error_count_after_half_open: None,
            metric_expired_time: Duration::from_secs(60),
        };
        let breaker = ErrorCountBreaker::new(&config, clock.clone());
        let data = ChainData::new(
            ServiceKey::new("Test", "svc"),
            vec![SlotInfo {
                name: "errorCount",
                request_after_half_open: breaker.request_after_half_open(),
            }],
            clock.clone(),
        );
        (clock, data, breaker)
    }

    #[test]
    fn test_invalid_settings_fall_back() {
        let config = ErrorCountConfig {
            continuous_error_threshold: 0,
            sleep_window: Duration::ZERO,
            request_count_after_half_open: -1,
            success_count_after_half_open: 50,
            error_count_after_half_open: Some(11),
            metric_expired_time: Duration::ZERO,
        };
        let s = ErrorCountSettings::from_config(&config);
        assert_eq!(s.continuous_error_threshold, 10);
        assert_eq!(s.sleep_window_ms, 30_000);
        assert_eq!(s.request_after_half_open, 10);
        assert_eq!(s.success_after_half_open, 10);
        assert_eq!(s.error_half_open_to_open, 1);
        assert_eq!(s.metric_expired_ms, 3_600_000);
    }

    #[test]
    fn test_opens_at_exact_threshold_and_success_resets() {
        let (_clock, data, breaker) = setup(3, 10, 8);
        let handle = data.handle(1, true);
        breaker.realtime("a", false, &handle);
        breaker.realtime("a", false, &handle);
        breaker.realtime("a", true, &handle);
        breaker.realtime("a", false, &handle);
        breaker.realtime("a", false, &handle);
        assert_eq!(data.status("a"), Close);
        breaker.realtime("a", false, &handle);
        assert_eq!(data.status("a"), Open);
    }

    #[test]
    fn test_half_open_recovers_after_successes() {
        let (clock, data, breaker) = setup(2, 4, 3);
        let handle = data.handle(1, true);
        breaker.realtime("a", false, &handle);
        breaker.realtime("a", false, &handle);
        assert_eq!(data.status("a"), Open);

        clock.advance_ms(4_999);
        breaker.timing(&handle);
        assert_eq!(data.status("a"), Open);
        clock.advance_ms(1);
        breaker.timing(&handle);
        assert_eq!(data.status("a"), HalfOpen);

        for _ in 0..3 {
            breaker.realtime("a", true, &handle);
        }
        breaker.timing(&handle);
        assert_eq!(data.status("a"), Close);
    }

    #[test]
    fn test_half_open_errors_reopen_immediately() {
        let (clock, data, breaker) = setup(1, 4, 3);
        let handle = data.handle(1, true);
        breaker.realtime("a", false, &handle);
        clock.advance_ms(5_000);
        breaker.timing(&handle);
        assert_eq!(data.status("a"), HalfOpen);
        // 4 requests, 3 must succeed: the second error reopens
        breaker.realtime("a", false, &handle);
        assert_eq!(data.status("a"), HalfOpen);
        breaker.realtime("a", false, &handle);
        assert_eq!(data.status("a"), Open);
    }

    #[test]
    fn test_configured_half_open_error_count() {
        let clock = Arc::new(ManualClock::new(10_000));
        let config = ErrorCountConfig {
            continuous_error_threshold: 1,
            sleep_window: Duration::from_secs(5),
            request_count_after_half_open: 10,
            success_count_after_half_open: 8,
            error_count_after_half_open: Some(1),
            metric_expired_time: Duration::from_secs(60),
        };
        let breaker = ErrorCountBreaker::new(&config, clock.clone());
        assert_eq!(breaker.settings().error_half_open_to_open, 1);
        let data = ChainData::new(
            ServiceKey::new("Test", "svc"),
            vec![SlotInfo {
                name: "errorCount",
                request_after_half_open: breaker.request_after_half_open(),
            }],
            clock.clone(),
        );
        let handle = data.handle(1, true);
        breaker.realtime("a", false, &handle);
        clock.advance_ms(5_000);
        breaker.timing(&handle);
        assert_eq!(data.status("a"), HalfOpen);
        // the derived default would tolerate 2 more errors
        breaker.realtime("a", false, &handle);
        assert_eq!(data.status("a"), Open);
    }

    #[test]
    fn test_no_auto_half_open_when_detection_owns_it() {
        let (clock, data, breaker) = setup(1, 4, 3);
        let handle = data.handle(1, false);
        breaker.realtime("a", false, &handle);
        clock.advance_ms(60_000);
        breaker.timing(&handle);
        assert_eq!(data.status("a"), Open);
    }

    #[test]
    fn test_stalled_half_open_reopens() {
        let (clock, data, breaker) = setup(1, 4, 3);
        let handle = data.handle(1, true);
        breaker.realtime("a", false, &handle);
        clock.advance_ms(5_000);
        breaker.timing(&handle);
        assert_eq!(data.status("a"), HalfOpen);
        clock.advance_ms(HALF_OPEN_STALL_WINDOWS * 5_000);
        breaker.timing(&handle);
        assert_eq!(data.status("a"), Open);
    }

    #[test]
    fn test_clean_status_drops_departed_instances() {
        let (clock, data, breaker) = setup(1, 4, 3);
        let handle = data.handle(1, true);
        breaker.realtime("gone", false, &handle);
        breaker.realtime("kept", false, &handle);
        clock.advance_ms(60_000);
        breaker.clean_status(&handle, &|id| id == "kept");
        assert_eq!(breaker.tracked(), 1);
        assert_eq!(data.status("gone"), Close);
        assert_eq!(data.status("kept"), Open);
    }
}
