//! Cache Metrics Collection
//!
//! Aggregate counters kept by the multi-tier façade itself. Per-tier
//! statistics live with each tier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Counters for requests served through the façade
#[derive(Debug, Default)]
pub struct OverallMetrics {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    /// Sum of response times in microseconds
    total_response_time_us: AtomicU64,
    errors: AtomicU64,
}

impl OverallMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Served from the memory or durable tier
    pub fn record_hit(&self, duration: Duration) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.record_response_time(duration);
    }

    /// Served by calling the fetcher directly
    pub fn record_direct_fetch(&self, duration: Duration) {
        self.record_response_time(duration);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_response_time(&self, duration: Duration) {
        self.total_response_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> OverallStats {
        let total = self.total_requests();
        let hits = self.cache_hits();
        let errors = self.errors();
        let total_us = self.total_response_time_us.load(Ordering::Relaxed);

        let (hit_rate, error_rate, avg_response_time) = if total == 0 {
            (0.0, 0.0, Duration::ZERO)
        } else {
            (
                hits as f64 / total as f64,
                errors as f64 / total as f64,
                Duration::from_micros(total_us / total),
            )
        };

        OverallStats {
            total_requests: total,
            cache_hits: hits,
            errors,
            hit_rate,
            error_rate,
            avg_response_time,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.total_response_time_us.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of the façade counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct OverallStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub error_rate: f64,
    pub avg_response_time: Duration,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
