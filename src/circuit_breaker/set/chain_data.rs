//! Subset breaker verdicts and the unhealthy-set map they maintain.
//!
//! # Responsibilities
//! - Turn a window summary into a verdict (close / preserved / open)
//! - Walk each key through open, half open (stepped release) and preserved
//! - Break the whole subset when a label opens under scope ALL
//! - Version and record every change; publish the map to the service

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::circuit_breaker::set::backend::MetricSummary;
use crate::model::breaker_rule::{BreakScope, DestinationSet, DEFAULT_SET_METRIC_WINDOW_MS, DEFAULT_SET_SLEEP_WINDOW_MS};
use crate::model::circuit_breaker::{CircuitChangeRecord, SetUnhealthyInfo, UnhealthySetsData};
use crate::model::{CircuitBreakerStatus, Service, ServiceKey};
use crate::observability::metrics;

use CircuitBreakerStatus::*;

/// Records kept per key.
pub const MAX_RECORDS_PER_KEY: usize = 16;

/// Verdict computed from one summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: CircuitBreakerStatus,
    pub total: u64,
    pub reason: String,
}

fn percent(count: u64, total: u64) -> u64 {
    count * 100 / total
}

/// Compare the summary against the destination's thresholds.
///
/// `None` when the window saw no calls.
pub fn compute_verdict(dst: &DestinationSet, summary: &MetricSummary) -> Option<Verdict> {
    let counts = &summary.counts;
    let total = counts.total;
    if total == 0 {
        return None;
    }
    let mut verdict = Verdict {
        status: Close,
        total,
        reason: String::new(),
    };
    let error_rate = &dst.policy.error_rate;
    if error_rate.enable && total >= error_rate.request_volume_threshold {
        let rate = percent(counts.errors, total);
        if rate >= error_rate.error_rate_to_open as u64 {
            verdict.status = Open;
            verdict.reason = format!("caused by err_rate {}%", rate);
            return Some(verdict);
        }
        if rate >= error_rate.error_rate_to_preserved as u64 {
            verdict.status = Preserved;
            verdict.reason = format!("caused by err_rate {}%", rate);
        }
        for special in &error_rate.specials {
            let count = counts.specific.get(&special.name).copied().unwrap_or(0);
            let rate = percent(count, total);
            if rate >= special.error_rate_to_open as u64 {
                verdict.status = Open;
                verdict.reason = format!("caused by {} rate {}%", special.name, rate);
                return Some(verdict);
            }
            if rate >= special.error_rate_to_preserved as u64 {
                verdict.status = Preserved;
                verdict.reason = format!("caused by {} rate {}%", special.name, rate);
            }
        }
    }
    let slow_rate = &dst.policy.slow_rate;
    if slow_rate.enable {
        let rate = percent(counts.slow, total);
        if slow_rate.slow_rate_to_open != 0 && rate >= slow_rate.slow_rate_to_open as u64 {
            verdict.status = Open;
            verdict.reason = format!("caused by slow_rate {}%", rate);
        } else if slow_rate.slow_rate_to_preserved != 0 && rate >= slow_rate.slow_rate_to_preserved as u64 {
            verdict.status = Preserved;
            verdict.reason = format!("caused by slow_rate {}%", rate);
        }
    }
    Some(verdict)
}

#[derive(Debug, Default)]
struct SetState {
    infos: HashMap<String, SetUnhealthyInfo>,
    records: HashMap<String, VecDeque<CircuitChangeRecord>>,
    version: u64,
    published_version: u64,
}

impl SetState {
    fn record(&mut self, key: &str, now_ms: u64, from: CircuitBreakerStatus, to: CircuitBreakerStatus, reason: String) {
        self.version += 1;
        let history = self.records.entry(key.to_string()).or_default();
        if history.len() == MAX_RECORDS_PER_KEY {
            history.pop_front();
        }
        history.push_back(CircuitChangeRecord {
            change_time_ms: now_ms,
            change_seq: self.version,
            from,
            to,
            reason,
        });
    }
}

/// Unhealthy `subset#labels` keys of one service.
#[derive(Debug)]
pub struct SetChainData {
    service_key: ServiceKey,
    state: Mutex<SetState>,
}

impl SetChainData {
    pub fn new(service_key: ServiceKey) -> Self {
        Self {
            service_key,
            state: Mutex::new(SetState::default()),
        }
    }

    /// Apply a window's verdict to `window_key`.
    ///
    /// `subset_key` is the `subset#` key broken alongside under scope ALL.
    pub fn judge(&self, window_key: &str, subset_key: &str, dst: &DestinationSet, summary: &MetricSummary) {
        let verdict = compute_verdict(dst, summary);
        let now = summary.timestamp_ms;
        let mut state = self.state.lock();
        if dst.scope == BreakScope::All && window_key != subset_key {
            if let Some(v) = verdict.as_ref().filter(|v| v.status == Open) {
                self.break_subset_all(&mut state, subset_key, now, &v.reason);
            }
        }
        self.change_one(&mut state, window_key, dst, verdict.as_ref(), now);
    }

    fn break_subset_all(&self, state: &mut SetState, subset_key: &str, now_ms: u64, reason: &str) {
        let from = state.infos.get(subset_key).map(|i| i.status).unwrap_or(Close);
        if from == Open {
            return;
        }
        state.infos.insert(
            subset_key.to_string(),
            SetUnhealthyInfo {
                status: Open,
                half_open_release_percent: 0.0,
                open_begin_time_ms: now_ms,
                last_half_open_release_time_ms: 0,
            },
        );
        let reason = format!("{} {} to {} scope all {}", subset_key, from, Open, reason);
        state.record(subset_key, now_ms, from, Open, reason);
        self.log_change(subset_key, from, Open);
    }

    fn change_one(&self, state: &mut SetState, key: &str, dst: &DestinationSet, verdict: Option<&Verdict>, now_ms: u64) {
        let Some(current) = state.infos.get(key).cloned() else {
            let Some(v) = verdict.filter(|v| v.status != Close) else {
                return;
            };
            state.infos.insert(
                key.to_string(),
                SetUnhealthyInfo {
                    status: v.status,
                    half_open_release_percent: 0.0,
                    open_begin_time_ms: now_ms,
                    last_half_open_release_time_ms: 0,
                },
            );
            let reason = format!("{} {} to {} {}", key, Close, v.status, v.reason);
            state.record(key, now_ms, Close, v.status, reason);
            self.log_change(key, Close, v.status);
            return;
        };

        let next = match current.status {
            Open => judge_open(dst, &current, now_ms),
            HalfOpen => judge_half_open(dst, &current, verdict, now_ms),
            Preserved => judge_preserved(&current, verdict, now_ms),
            Close => None,
        };
        let Some(next) = next else {
            return;
        };
        let from = current.status;
        let to = next.status;
        let reason = match verdict {
            Some(v) => format!("{} {} to {} {}", key, from, to, v.reason),
            None => format!("{} {} to {}", key, from, to),
        };
        if to == Close {
            state.infos.remove(key);
        } else {
            state.infos.insert(key.to_string(), next);
        }
        if from != to {
            self.log_change(key, from, to);
        }
        state.record(key, now_ms, from, to, reason);
    }

    fn log_change(&self, key: &str, from: CircuitBreakerStatus, to: CircuitBreakerStatus) {
        metrics::record_breaker_transition("set", from, to);
        tracing::info!(service = %self.service_key, key, from = %from, to = %to, "Set circuit breaker status changed");
    }

    pub fn info(&self, key: &str) -> Option<SetUnhealthyInfo> {
        self.state.lock().infos.get(key).cloned()
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn records(&self, key: &str) -> Vec<CircuitChangeRecord> {
        self.state
            .lock()
            .records
            .get(key)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Publish to `service` when the version moved since the last publish.
    pub fn check_and_sync(&self, service: &Service) -> bool {
        let data = {
            let mut state = self.state.lock();
            if state.version == state.published_version {
                return false;
            }
            state.published_version = state.version;
            UnhealthySetsData {
                version: state.version,
                infos: state.infos.clone(),
            }
        };
        let version = data.version;
        let published = service.set_unhealthy_sets(data);
        tracing::debug!(service = %self.service_key, version, published, "Unhealthy sets synced");
        published
    }
}

fn sleep_window_ms(dst: &DestinationSet) -> u64 {
    match dst.recover.sleep_window_ms {
        0 => DEFAULT_SET_SLEEP_WINDOW_MS,
        ms => ms,
    }
}

fn metric_window_ms(dst: &DestinationSet) -> u64 {
    match dst.metric_window_ms {
        0 => DEFAULT_SET_METRIC_WINDOW_MS,
        ms => ms,
    }
}

/// Open → HalfOpen once the sleep window passed, releasing the first step.
fn judge_open(dst: &DestinationSet, info: &SetUnhealthyInfo, now_ms: u64) -> Option<SetUnhealthyInfo> {
    if now_ms.saturating_sub(info.open_begin_time_ms) < sleep_window_ms(dst) {
        return None;
    }
    let percent = dst
        .recover
        .request_rate_after_half_open
        .first()
        .map(|step| *step as f32 / 100.0)
        .unwrap_or(1.0);
    Some(SetUnhealthyInfo {
        status: HalfOpen,
        half_open_release_percent: percent,
        last_half_open_release_time_ms: now_ms,
        ..info.clone()
    })
}

/// While healthy, raise the release step once per metric window and close
/// after the last step; any Open verdict reopens.
fn judge_half_open(
    dst: &DestinationSet,
    info: &SetUnhealthyInfo,
    verdict: Option<&Verdict>,
    now_ms: u64,
) -> Option<SetUnhealthyInfo> {
    let verdict = verdict?;
    match verdict.status {
        Close if verdict.total > 0 => {
            if now_ms.saturating_sub(info.last_half_open_release_time_ms) < metric_window_ms(dst) {
                return None;
            }
            let steps = &dst.recover.request_rate_after_half_open;
            let next_percent = if steps.is_empty() {
                if info.half_open_release_percent > 0.0 {
                    None
                } else {
                    Some(1.0)
                }
            } else {
                let released = (info.half_open_release_percent * 100.0).round() as u32;
                steps.iter().find(|step| **step > released).map(|step| *step as f32 / 100.0)
            };
            match next_percent {
                None => Some(SetUnhealthyInfo {
                    status: Close,
                    ..SetUnhealthyInfo::default()
                }),
                Some(percent) => Some(SetUnhealthyInfo {
                    half_open_release_percent: percent,
                    last_half_open_release_time_ms: now_ms,
                    ..info.clone()
                }),
            }
        }
        Open => Some(SetUnhealthyInfo {
            status: Open,
            half_open_release_percent: 0.0,
            open_begin_time_ms: now_ms,
            ..info.clone()
        }),
        _ => None,
    }
}

fn judge_preserved(info: &SetUnhealthyInfo, verdict: Option<&Verdict>, now_ms: u64) -> Option<SetUnhealthyInfo> {
    let verdict = verdict?;
    match verdict.status {
        Close if verdict.total != 0 => Some(SetUnhealthyInfo {
            status: Close,
            ..SetUnhealthyInfo::default()
        }),
        Open => Some(SetUnhealthyInfo {
            status: Open,
            open_begin_time_ms: now_ms,
            ..info.clone()
        }),
        _ => None,
    }
}
