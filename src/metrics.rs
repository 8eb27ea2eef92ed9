//! Request counters and latency percentiles.
//!
//! Counters are plain atomics; latency goes into an HdrHistogram behind a
//! `parking_lot` lock. The secure handler wrapper records every request it
//! answers, and `/status` reads a [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Request latency percentile metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyMetrics {
    /// 50th percentile (median) latency in milliseconds
    pub p50_ms: f64,
    /// 95th percentile latency in milliseconds
    pub p95_ms: f64,
    /// 99th percentile latency in milliseconds
    pub p99_ms: f64,
    /// Total number of requests recorded
    pub total_requests: u64,
    /// Mean latency in milliseconds
    pub mean_ms: f64,
    /// Maximum latency recorded in milliseconds
    pub max_ms: f64,
}

/// Thread-safe latency histogram.
///
/// Tracks latencies from 1 microsecond to 60 seconds with 3 significant
/// figures of precision.
#[derive(Debug)]
pub struct LatencyHistogram {
    inner: RwLock<Histogram<u64>>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let histogram =
            Histogram::new_with_bounds(1, 60_000_000, 3).expect("static histogram bounds");
        Self {
            inner: RwLock::new(histogram),
        }
    }

    /// Record a latency duration. Values outside the bounds are saturated.
    pub fn record_duration(&self, duration: Duration) {
        let micros = (duration.as_micros() as u64).clamp(1, 60_000_000);
        let mut hist = self.inner.write();
        let _ = hist.record(micros);
    }

    pub fn count(&self) -> u64 {
        self.inner.read().len()
    }

    /// Percentiles converted to milliseconds.
    pub fn metrics(&self) -> LatencyMetrics {
        let hist = self.inner.read();
        LatencyMetrics {
            p50_ms: hist.value_at_percentile(50.0) as f64 / 1000.0,
            p95_ms: hist.value_at_percentile(95.0) as f64 / 1000.0,
            p99_ms: hist.value_at_percentile(99.0) as f64 / 1000.0,
            total_requests: hist.len(),
            mean_ms: hist.mean() / 1000.0,
            max_ms: hist.max() as f64 / 1000.0,
        }
    }

    pub fn reset(&self) {
        self.inner.write().reset();
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter values at one instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub requests_total: u64,
    pub requests_ok: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub rate_limited: u64,
    pub replay_rejected: u64,
    pub version_conflicts: u64,
    pub duplicate_webhooks: u64,
    pub timeouts: u64,
    pub latency: LatencyMetrics,
}

/// Process-wide guard metrics.
#[derive(Debug)]
pub struct GuardMetrics {
    start_time: Instant,
    requests_total: AtomicU64,
    requests_ok: AtomicU64,
    client_errors: AtomicU64,
    server_errors: AtomicU64,
    rate_limited: AtomicU64,
    replay_rejected: AtomicU64,
    version_conflicts: AtomicU64,
    duplicate_webhooks: AtomicU64,
    timeouts: AtomicU64,
    latency: LatencyHistogram,
}

impl GuardMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests_total: AtomicU64::new(0),
            requests_ok: AtomicU64::new(0),
            client_errors: AtomicU64::new(0),
            server_errors: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            replay_rejected: AtomicU64::new(0),
            version_conflicts: AtomicU64::new(0),
            duplicate_webhooks: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
        }
    }

    /// Record one answered request. `code` is the error code, if any.
    pub fn record_request(&self, status: StatusCode, code: Option<&str>, duration: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.latency.record_duration(duration);

        let bucket = if status.is_server_error() {
            &self.server_errors
        } else if status.is_client_error() {
            &self.client_errors
        } else {
            &self.requests_ok
        };
        bucket.fetch_add(1, Ordering::Relaxed);

        let specific = match code {
            Some("RATE_LIMITED") => Some(&self.rate_limited),
            Some("REPLAY_REJECTED") => Some(&self.replay_rejected),
            Some("VERSION_CONFLICT") => Some(&self.version_conflicts),
            Some("TIMEOUT") => Some(&self.timeouts),
            _ => None,
        };
        if let Some(counter) = specific {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_duplicate_webhook(&self) -> u64 {
        self.duplicate_webhooks.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.load(Ordering::Relaxed),
            client_errors: self.client_errors.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            replay_rejected: self.replay_rejected.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            duplicate_webhooks: self.duplicate_webhooks.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            latency: self.latency.metrics(),
        }
    }
}

impl Default for GuardMetrics {
    fn default() -> Self {
        Self::new()
    }
}
