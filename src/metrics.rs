use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Error;
use crate::response::Response;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineMetricsSnapshot {
    pub calls_started: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub sends: u64,
    pub retries: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub refresh_retries: u64,
    pub unauthorized: u64,
    pub deadline_exceeded: u64,
    pub transport_errors: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PipelineMetrics {
    inner: Arc<PipelineMetricsInner>,
}

#[derive(Debug, Default)]
struct PipelineMetricsInner {
    calls_started: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    sends: AtomicU64,
    retries: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    refresh_retries: AtomicU64,
    unauthorized: AtomicU64,
    deadline_exceeded: AtomicU64,
    transport_errors: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: PipelineMetrics,
}

impl PipelineMetrics {
    pub(crate) fn record_call_started(&self) {
        self.inner.calls_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_send(&self) {
        self.inner.sends.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh(&self) {
        self.inner.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_failure(&self) {
        self.inner.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_retry(&self) {
        self.inner.refresh_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unauthorized(&self) {
        self.inner.unauthorized.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_call_completed(&self, result: &Result<Response, Error>, latency: Duration) {
        self.record_latency(latency);
        match result {
            Ok(response) => {
                self.inner.calls_succeeded.fetch_add(1, Ordering::Relaxed);
                self.add_status_count(response.status().as_u16());
            }
            Err(error) => {
                self.inner.calls_failed.fetch_add(1, Ordering::Relaxed);
                match error {
                    Error::DeadlineExceeded { .. } => {
                        self.inner.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Error::Transport { .. } => {
                        self.inner.transport_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                if let Some(status) = error.status() {
                    self.add_status_count(status.as_u16());
                }
                self.add_error_count(error.code().as_str());
            }
        }
    }

    pub(crate) fn snapshot(&self) -> PipelineMetricsSnapshot {
        let latency_samples = self.inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = self.inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        PipelineMetricsSnapshot {
            calls_started: self.inner.calls_started.load(Ordering::Relaxed),
            calls_succeeded: self.inner.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.inner.calls_failed.load(Ordering::Relaxed),
            sends: self.inner.sends.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            refreshes: self.inner.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.inner.refresh_failures.load(Ordering::Relaxed),
            refresh_retries: self.inner.refresh_retries.load(Ordering::Relaxed),
            unauthorized: self.inner.unauthorized.load(Ordering::Relaxed),
            deadline_exceeded: self.inner.deadline_exceeded.load(Ordering::Relaxed),
            transport_errors: self.inner.transport_errors.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&self.inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    fn add_status_count(&self, status: u16) {
        let mut status_counts = lock_unpoisoned(&self.inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: &str) {
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts.entry(error_key.to_owned()).or_insert(0) += 1;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
