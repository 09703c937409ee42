//! Passive request counters shared by the proxy and chat paths

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Maximum number of latency samples retained
pub const LATENCY_WINDOW: usize = 1000;

/// Number of most recent samples averaged in a snapshot
pub const LATENCY_AVERAGE_SAMPLES: usize = 100;

/// Point-in-time copy of every counter
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub cache_hits: u64,
    pub average_response_time_ms: f64,
    pub uptime_seconds: u64,
    pub requests_per_minute: f64,
}

/// Lock-free counters plus a bounded FIFO of latency samples
pub struct MetricsCollector {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    cache_hits: AtomicU64,
    latencies_ms: Mutex<VecDeque<f64>>,
    started_at: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            started_at: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, latency: Duration) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        let mut samples = self.latencies_ms.lock();
        if samples.len() == LATENCY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(latency.as_secs_f64() * 1000.0);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let average_response_time_ms = {
            let samples = self.latencies_ms.lock();
            let recent = samples.len().min(LATENCY_AVERAGE_SAMPLES);
            if recent == 0 {
                0.0
            } else {
                samples.iter().rev().take(recent).sum::<f64>() / recent as f64
            }
        };

        let uptime = now.saturating_duration_since(self.started_at);
        let total_requests = self.total.load(Ordering::Relaxed);
        let minutes = uptime.as_secs_f64() / 60.0;
        let requests_per_minute = if minutes > 0.0 {
            total_requests as f64 / minutes
        } else {
            0.0
        };

        MetricsSnapshot {
            total_requests,
            successful_requests: self.successful.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            rate_limited_requests: self.rate_limited.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            average_response_time_ms,
            uptime_seconds: uptime.as_secs(),
            requests_per_minute,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.latencies_ms.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_success(Duration::from_millis(10));
        metrics.record_failure(Duration::from_millis(30));
        metrics.record_rate_limited();
        metrics.record_cache_hit();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.rate_limited_requests, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert!((snapshot.average_response_time_ms - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_latency_window_is_bounded_fifo() {
        let metrics = MetricsCollector::new();
        for _ in 0..LATENCY_WINDOW {
            metrics.record_success(Duration::from_millis(1));
        }
        for _ in 0..LATENCY_AVERAGE_SAMPLES {
            metrics.record_success(Duration::from_millis(5));
        }
        assert_eq!(metrics.sample_count(), LATENCY_WINDOW);
        // Only the most recent samples count toward the average
        assert!((metrics.snapshot().average_response_time_ms - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_snapshot() {
        let metrics = MetricsCollector::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.average_response_time_ms, 0.0);
    }

    #[test]
    fn test_requests_per_minute_uses_uptime() {
        let metrics = MetricsCollector::new();
        for _ in 0..30 {
            metrics.record_request();
        }
        let later = metrics.started_at + Duration::from_secs(120);
        let snapshot = metrics.snapshot_at(later);
        assert_eq!(snapshot.uptime_seconds, 120);
        assert!((snapshot.requests_per_minute - 15.0).abs() < 1e-6);
    }
}
