//! Metric backend seen by the set breaker.
//!
//! # Responsibilities
//! - Define the init / report / query capability the set breaker consumes
//! - Provide an in-process backend aggregating reports over a sliding window
//! - Retry failed reports with jittered exponential backoff
//! - Run every backend call on the blocking pool so a slow backend never
//!   stalls a runtime worker

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{PolarisError, PolarisResult};
use crate::model::ServiceKey;
use crate::time::Clock;

pub const REPORT_MAX_ATTEMPTS: u32 = 3;
const REPORT_BACKOFF_BASE_MS: u64 = 100;
const REPORT_BACKOFF_MAX_MS: u64 = 1_000;

/// Identity of one metric series: a `(subset, labels)` pair of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub service_key: ServiceKey,
    pub subset: String,
    pub labels: String,
}

/// Counters of one report or one query answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricCounts {
    pub total: u64,
    pub errors: u64,
    pub slow: u64,
    /// Special error class name → count.
    pub specific: BTreeMap<String, u64>,
}

impl MetricCounts {
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn merge(&mut self, other: &MetricCounts) {
        self.total += other.total;
        self.errors += other.errors;
        self.slow += other.slow;
        for (name, count) in &other.specific {
            *self.specific.entry(name.clone()).or_default() += count;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricReport {
    pub key: MetricKey,
    pub timestamp_ms: u64,
    pub counts: MetricCounts,
}

/// Aggregate over the queried window, stamped with the backend's time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricSummary {
    pub timestamp_ms: u64,
    pub counts: MetricCounts,
}

/// Where set breaker windows report and read their metrics.
pub trait MetricsBackend: Send + Sync + std::fmt::Debug {
    /// Declare a series with its window and precision.
    fn init(&self, key: &MetricKey, window_ms: u64, precision: u32) -> PolarisResult<()>;

    fn report(&self, report: &MetricReport) -> PolarisResult<()>;

    fn query(&self, key: &MetricKey, window_ms: u64) -> PolarisResult<MetricSummary>;
}

/// Jittered exponential delay before retry `attempt` (1-based).
pub fn report_backoff(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let delay = REPORT_BACKOFF_BASE_MS
        .saturating_mul(2u64.saturating_pow(attempt - 1))
        .min(REPORT_BACKOFF_MAX_MS);
    let jitter_range = delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    Duration::from_millis(delay + jitter)
}

async fn call_blocking<T, F>(backend: &Arc<dyn MetricsBackend>, call: F) -> PolarisResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn MetricsBackend) -> PolarisResult<T> + Send + 'static,
{
    let backend = backend.clone();
    tokio::task::spawn_blocking(move || call(backend.as_ref()))
        .await
        .map_err(|e| PolarisError::ServerError(format!("metric backend call aborted: {}", e)))?
}

pub async fn init_metric(backend: &Arc<dyn MetricsBackend>, key: &MetricKey, window_ms: u64, precision: u32) -> PolarisResult<()> {
    let key = key.clone();
    call_blocking(backend, move |b| b.init(&key, window_ms, precision)).await
}

pub async fn query_metric(backend: &Arc<dyn MetricsBackend>, key: &MetricKey, window_ms: u64) -> PolarisResult<MetricSummary> {
    let key = key.clone();
    call_blocking(backend, move |b| b.query(&key, window_ms)).await
}

/// Report, retrying server-side failures up to [`REPORT_MAX_ATTEMPTS`] times.
pub async fn report_with_retry(backend: &Arc<dyn MetricsBackend>, report: &MetricReport) -> PolarisResult<()> {
    let mut attempt = 1;
    loop {
        let pending = report.clone();
        match call_blocking(backend, move |b| b.report(&pending)).await {
            Ok(()) => return Ok(()),
            Err(PolarisError::ServerError(msg)) if attempt < REPORT_MAX_ATTEMPTS => {
                let delay = report_backoff(attempt);
                tracing::debug!(
                    subset = %report.key.subset,
                    labels = %report.key.labels,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %msg,
                    "Metric report failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug)]
struct Series {
    bucket_ms: u64,
    precision: u32,
    /// `(bucket epoch, counts)`, oldest first.
    buckets: VecDeque<(u64, MetricCounts)>,
}

impl Series {
    fn evict(&mut self, now_epoch: u64) {
        let oldest = now_epoch.saturating_sub(self.precision as u64 - 1);
        while self.buckets.front().map(|(epoch, _)| *epoch < oldest).unwrap_or(false) {
            self.buckets.pop_front();
        }
    }
}

/// Keeps every series in memory, bucketed by report time.
#[derive(Debug)]
pub struct LocalMetricsBackend {
    clock: Arc<dyn Clock>,
    series: Mutex<HashMap<MetricKey, Series>>,
}

impl LocalMetricsBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            series: Mutex::new(HashMap::new()),
        }
    }

    pub fn series_count(&self) -> usize {
        self.series.lock().len()
    }
}

impl MetricsBackend for LocalMetricsBackend {
    fn init(&self, key: &MetricKey, window_ms: u64, precision: u32) -> PolarisResult<()> {
        if window_ms == 0 || precision == 0 {
            return Err(PolarisError::InvalidArgument(format!(
                "metric window {}ms / precision {} for {}",
                window_ms, precision, key.service_key
            )));
        }
        let mut series = self.series.lock();
        series.entry(key.clone()).or_insert_with(|| Series {
            bucket_ms: (window_ms / precision as u64).max(1),
            precision,
            buckets: VecDeque::new(),
        });
        Ok(())
    }

    fn report(&self, report: &MetricReport) -> PolarisResult<()> {
        let mut series = self.series.lock();
        let entry = series
            .get_mut(&report.key)
            .ok_or_else(|| PolarisError::ResourceNotFound(format!("metric series {:?}", report.key)))?;
        let epoch = report.timestamp_ms / entry.bucket_ms;
        match entry.buckets.back_mut() {
            Some((last, counts)) if *last == epoch => counts.merge(&report.counts),
            Some((last, _)) if *last > epoch => {
                // late report: fold into the bucket it belongs to, if still kept
                if let Some((_, counts)) = entry.buckets.iter_mut().find(|(e, _)| *e == epoch) {
                    counts.merge(&report.counts);
                }
            }
            _ => entry.buckets.push_back((epoch, report.counts.clone())),
        }
        entry.evict(epoch);
        Ok(())
    }

    fn query(&self, key: &MetricKey, _window_ms: u64) -> PolarisResult<MetricSummary> {
        let now = self.clock.now_ms();
        let mut series = self.series.lock();
        let entry = series
            .get_mut(key)
            .ok_or_else(|| PolarisError::ResourceNotFound(format!("metric series {:?}", key)))?;
        entry.evict(now / entry.bucket_ms);
        let mut counts = MetricCounts::default();
        for (_, bucket) in &entry.buckets {
            counts.merge(bucket);
        }
        Ok(MetricSummary {
            timestamp_ms: now,
            counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> MetricKey {
        MetricKey {
            service_key: ServiceKey::new("Test", "svc"),
            subset: "set:s1".into(),
            labels: "".into(),
        }
    }

    fn counts(total: u64, errors: u64) -> MetricCounts {
        MetricCounts {
            total,
            errors,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(report_backoff(0), Duration::ZERO);
        assert!(report_backoff(1) >= Duration::from_millis(100));
        assert!(report_backoff(2) >= Duration::from_millis(200));
        assert!(report_backoff(10) < Duration::from_millis(1_100));
    }

    #[test]
    fn test_local_backend_window() {
        let clock = Arc::new(ManualClock::new(60_000));
        let backend = LocalMetricsBackend::new(clock.clone());
        assert!(backend.report(&MetricReport { key: key(), timestamp_ms: 60_000, counts: counts(1, 1) }).is_err());

        backend.init(&key(), 60_000, 12).unwrap();
        backend.report(&MetricReport { key: key(), timestamp_ms: 60_000, counts: counts(10, 4) }).unwrap();
        clock.advance_ms(30_000);
        backend.report(&MetricReport { key: key(), timestamp_ms: 90_000, counts: counts(10, 1) }).unwrap();
        let summary = backend.query(&key(), 60_000).unwrap();
        assert_eq!(summary.counts, counts(20, 5));
        assert_eq!(summary.timestamp_ms, 90_000);

        // the first report leaves the 60s window
        clock.advance_ms(35_000);
        assert_eq!(backend.query(&key(), 60_000).unwrap().counts, counts(10, 1));
    }

    #[derive(Debug, Default)]
    struct Flaky {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl MetricsBackend for Flaky {
        fn init(&self, _: &MetricKey, _: u64, _: u32) -> PolarisResult<()> {
            Ok(())
        }

        fn report(&self, _: &MetricReport) -> PolarisResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(PolarisError::ServerError("busy".into()));
            }
            Ok(())
        }

        fn query(&self, _: &MetricKey, _: u64) -> PolarisResult<MetricSummary> {
            Ok(MetricSummary::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_retries_server_errors() {
        let report = MetricReport { key: key(), timestamp_ms: 0, counts: counts(1, 0) };
        let flaky = Arc::new(Flaky { failures: AtomicU32::new(2), ..Default::default() });
        let backend: Arc<dyn MetricsBackend> = flaky.clone();
        report_with_retry(&backend, &report).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

        let down = Arc::new(Flaky { failures: AtomicU32::new(5), ..Default::default() });
        let backend: Arc<dyn MetricsBackend> = down.clone();
        assert!(report_with_retry(&backend, &report).await.is_err());
        assert_eq!(down.calls.load(Ordering::SeqCst), REPORT_MAX_ATTEMPTS);
    }
}
