//! Durable Cache - shared warm tier
//!
//! Wraps a [`PersistentStore`] with retry, health tracking and fallback.
//!
//! # Retry
//!
//! Each `get` makes up to `max_retries + 1` attempts through the store. The
//! delay before retry `n` (n >= 1) is `retry_delay * 2^(n-1)`. There is no
//! overall deadline; the error of the final attempt is the one surfaced (or
//! handed over to the fallback decision).
//!
//! # Health
//!
//! Every operation is recorded as a success or failure. With monitoring
//! enabled, each recorded operation is followed by a health check; while
//! `failure_rate >= alert_threshold` every registered alert callback runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use super::metrics::LatencyTracker;
use super::store::{PersistOptions, PersistentStore, StoreStats};
use super::Fetcher;
use crate::error::Result;

/// Durable cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableCacheConfig {
    /// Revalidation age used when `get` is called without a TTL
    #[serde(rename = "default_ttl_ms", with = "crate::config::duration_ms")]
    pub default_ttl: Duration,
    /// Run a health check after every operation
    pub enable_health_monitoring: bool,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Base backoff delay, doubled per retry
    #[serde(rename = "retry_delay_ms", with = "crate::config::duration_ms")]
    pub retry_delay: Duration,
    /// Failure rate at or above which the tier is unhealthy
    pub alert_threshold: f64,
}

impl Default for DurableCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60 * 60),
            enable_health_monitoring: true,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            alert_threshold: 0.1,
        }
    }
}

/// Health snapshot of the durable tier
#[derive(Debug, Clone, Serialize)]
pub struct CacheHealthMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// failed / total, 0 before the first request
    pub failure_rate: f64,
    pub avg_response_time: Duration,
    pub last_health_check: Option<DateTime<Utc>>,
    /// `failure_rate < alert_threshold`
    pub is_healthy: bool,
}

/// Invoked with the current metrics while the tier is unhealthy
pub type HealthAlertCallback = Arc<dyn Fn(&CacheHealthMetrics) + Send + Sync>;

/// Per-call options for [`DurableCache::get`]
#[derive(Clone, Default)]
pub struct DurableGetOptions {
    /// Extra invalidation tags (the key itself is always added)
    pub tags: Vec<String>,
    /// Revalidation age, defaults to the configured TTL
    pub ttl: Option<Duration>,
    /// Called once when every attempt failed; its result is not persisted
    pub fallback: Option<Fetcher>,
}

/// One entry for [`DurableCache::warm_cache`]
#[derive(Clone)]
pub struct DurableWarmEntry {
    pub key: String,
    pub fetcher: Fetcher,
    pub tags: Vec<String>,
    pub ttl: Option<Duration>,
}

/// Outcome of a best-effort warm-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Default)]
struct HealthCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    response_time_us: AtomicU64,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
}

/// Durable cache - retrying, health-monitored access to the store
pub struct DurableCache {
    store: Arc<dyn PersistentStore>,
    config: DurableCacheConfig,
    health: HealthCounters,
    alert_callbacks: RwLock<Vec<HealthAlertCallback>>,
}

impl DurableCache {
    /// Create a durable cache over `store`
    pub fn new(store: Arc<dyn PersistentStore>, config: DurableCacheConfig) -> Self {
        Self {
            store,
            config,
            health: HealthCounters::default(),
            alert_callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Get through the store, retrying with backoff, then the fallback
    #[instrument(skip(self, fetcher, options))]
    pub async fn get(
        &self,
        key: &str,
        fetcher: Fetcher,
        options: DurableGetOptions,
    ) -> Result<Value> {
        let tracker = LatencyTracker::start();

        let mut tags = options.tags;
        if !tags.iter().any(|t| t == key) {
            tags.push(key.to_string());
        }
        let persist = PersistOptions {
            tags,
            ttl: options.ttl.unwrap_or(self.config.default_ttl),
        };

        let primary = self.fetch_with_retry(key, &fetcher, &persist).await;
        let result = match (primary, options.fallback) {
            (Ok(value), _) => Ok(value),
            (Err(e), Some(fallback)) => {
                warn!(key, error = %e, "durable tier exhausted, using fallback");
                fallback().await
            }
            (Err(e), None) => Err(e),
        };

        self.record_operation(result.is_ok(), tracker.elapsed());
        result
    }

    async fn fetch_with_retry(
        &self,
        key: &str,
        fetcher: &Fetcher,
        persist: &PersistOptions,
    ) -> Result<Value> {
        let attempts = self.config.max_retries + 1;
        let mut attempt = 0;

        loop {
            match self.store.get_or_fetch(key, fetcher.clone(), persist).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(key, attempt = attempt + 1, "durable fetch recovered");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= attempts {
                        warn!(key, attempts, error = %e, "durable fetch failed after all attempts");
                        return Err(e);
                    }

                    let delay = backoff_delay(self.config.retry_delay, attempt);
                    warn!(
                        key,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "durable fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Revalidate every tag in the store.
    ///
    /// All tags are attempted; the first failure is returned afterwards.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> Result<()> {
        let mut first_error = None;

        for tag in tags {
            let tracker = LatencyTracker::start();
            let result = self.store.revalidate_tag(tag).await;
            self.record_operation(result.is_ok(), tracker.elapsed());

            if let Err(e) = result {
                warn!(tag = %tag, error = %e, "durable tag invalidation failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Invalidate one key (every entry is tagged with its own key)
    pub async fn invalidate_key(&self, key: &str) -> Result<()> {
        self.invalidate_by_tags(&[key.to_string()]).await
    }

    /// Populate the store for several keys. Never fails as a whole.
    pub async fn warm_cache(&self, entries: Vec<DurableWarmEntry>) -> WarmReport {
        let total = entries.len();
        let results = join_all(entries.into_iter().map(|entry| async move {
            let options = DurableGetOptions {
                tags: entry.tags,
                ttl: entry.ttl,
                fallback: None,
            };
            let result = self.get(&entry.key, entry.fetcher, options).await;
            if let Err(e) = &result {
                warn!(key = %entry.key, error = %e, "durable warm-up failed");
            }
            result.is_ok()
        }))
        .await;

        let succeeded = results.into_iter().filter(|ok| *ok).count();
        debug!(succeeded, total, "durable warm-up finished");
        WarmReport {
            succeeded,
            failed: total - succeeded,
        }
    }

    /// Register a callback for unhealthy checks
    pub fn on_health_alert<F>(&self, callback: F)
    where
        F: Fn(&CacheHealthMetrics) + Send + Sync + 'static,
    {
        self.alert_callbacks.write().push(Arc::new(callback));
    }

    /// Current health snapshot
    pub fn health_metrics(&self) -> CacheHealthMetrics {
        let total = self.health.total.load(Ordering::Relaxed);
        let successful = self.health.successful.load(Ordering::Relaxed);
        let failed = self.health.failed.load(Ordering::Relaxed);

        let (failure_rate, avg_response_time) = if total == 0 {
            (0.0, Duration::ZERO)
        } else {
            (
                failed as f64 / total as f64,
                Duration::from_micros(self.health.response_time_us.load(Ordering::Relaxed) / total),
            )
        };

        CacheHealthMetrics {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            failure_rate,
            avg_response_time,
            last_health_check: *self.health.last_health_check.lock(),
            is_healthy: failure_rate < self.config.alert_threshold,
        }
    }

    /// Zero the health counters
    pub fn reset_health_metrics(&self) {
        self.health.total.store(0, Ordering::Relaxed);
        self.health.successful.store(0, Ordering::Relaxed);
        self.health.failed.store(0, Ordering::Relaxed);
        self.health.response_time_us.store(0, Ordering::Relaxed);
        *self.health.last_health_check.lock() = None;
    }

    /// Statistics of the underlying store
    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Get configuration
    pub fn config(&self) -> &DurableCacheConfig {
        &self.config
    }

    fn record_operation(&self, success: bool, elapsed: Duration) {
        self.health.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.health.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.health.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.health
            .response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        if self.config.enable_health_monitoring {
            self.check_health();
        }
    }

    fn check_health(&self) {
        *self.health.last_health_check.lock() = Some(Utc::now());
        let metrics = self.health_metrics();
        if metrics.is_healthy {
            return;
        }

        let callbacks = self.alert_callbacks.read().clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&metrics))).is_err() {
                error!("durable health alert callback panicked");
            }
        }
    }
}

/// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fetcher;
    use crate::cache::store::InMemoryPersistentStore;
    use crate::error::Error;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> DurableCacheConfig {
        DurableCacheConfig {
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    /// Fails `failures` times, then returns `value`
    fn flaky(calls: Arc<AtomicUsize>, failures: usize, value: Value) -> Fetcher {
        fetcher(move || {
            let calls = calls.clone();
            let value = value.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(Error::Fetch(format!("failure {}", n + 1)))
                } else {
                    Ok(value)
                }
            }
        })
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let store = Arc::new(InMemoryPersistentStore::new());
        let cache = DurableCache::new(store, fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let value = cache
            .get("k", flaky(calls.clone(), 2, json!("ok")), DurableGetOptions::default())
            .await
            .unwrap();

        assert_eq!(value, json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let health = cache.health_metrics();
        assert_eq!(health.total_requests, 1);
        assert_eq!(health.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_surfaces_last_error() {
        let store = Arc::new(InMemoryPersistentStore::new());
        let cache = DurableCache::new(store, fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let err = cache
            .get("k", flaky(calls.clone(), 100, json!(0)), DurableGetOptions::default())
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err, Error::Fetch("failure 4".into()));
        assert_eq!(cache.health_metrics().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_fallback_takes_precedence_over_error() {
        let store = Arc::new(InMemoryPersistentStore::new());
        let cache = DurableCache::new(store.clone(), fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let options = DurableGetOptions {
            fallback: Some(fetcher(|| async { Ok(json!("fallback")) })),
            ..Default::default()
        };
        let value = cache
            .get("k", flaky(calls.clone(), 100, json!(0)), options)
            .await
            .unwrap();

        assert_eq!(value, json!("fallback"));
        assert!(!store.contains("k"));

        let health = cache.health_metrics();
        assert_eq!(health.successful_requests, 1);
        assert_eq!(health.failed_requests, 0);
    }

    #[tokio::test]
    async fn test_failing_fallback_propagates() {
        let store = Arc::new(InMemoryPersistentStore::new());
        let cache = DurableCache::new(store, fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let options = DurableGetOptions {
            fallback: Some(fetcher(|| async { Err(Error::Fetch("fallback down".into())) })),
            ..Default::default()
        };
        let err = cache
            .get("k", flaky(calls, 100, json!(0)), options)
            .await
            .unwrap_err();

        assert_eq!(err, Error::Fetch("fallback down".into()));
    }

    #[tokio::test]
    async fn test_key_is_always_a_tag() {
        let store = Arc::new(InMemoryPersistentStore::new());
        let cache = DurableCache::new(store.clone(), fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get("k", flaky(calls.clone(), 0, json!(1)), DurableGetOptions::default())
            .await
            .unwrap();
        assert!(store.contains("k"));

        cache.invalidate_key("k").await.unwrap();
        assert!(!store.contains("k"));

        cache
            .get("k", flaky(calls.clone(), 0, json!(1)), DurableGetOptions::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_by_tags() {
        let store = Arc::new(InMemoryPersistentStore::new());
        let cache = DurableCache::new(store.clone(), fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let options = DurableGetOptions {
            tags: vec!["listings".to_string()],
            ..Default::default()
        };
        cache
            .get("a", flaky(calls.clone(), 0, json!(1)), options)
            .await
            .unwrap();

        cache
            .invalidate_by_tags(&["listings".to_string(), "listings".to_string()])
            .await
            .unwrap();
        assert!(!store.contains("a"));
    }

    #[tokio::test]
    async fn test_health_alerts() {
        let store = Arc::new(InMemoryPersistentStore::new());
        let cache = DurableCache::new(
            store,
            DurableCacheConfig {
                max_retries: 0,
                alert_threshold: 0.5,
                ..fast_config()
            },
        );
        let alerts = Arc::new(AtomicUsize::new(0));
        let seen = alerts.clone();
        cache.on_health_alert(move |metrics| {
            assert!(!metrics.is_healthy);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        cache.on_health_alert(|_| panic!("alert sink exploded"));

        let ok = Arc::new(AtomicUsize::new(0));
        cache
            .get("good", flaky(ok, 0, json!(1)), DurableGetOptions::default())
            .await
            .unwrap();
        assert_eq!(alerts.load(Ordering::SeqCst), 0);

        let bad = Arc::new(AtomicUsize::new(0));
        let _ = cache
            .get("bad", flaky(bad, 100, json!(1)), DurableGetOptions::default())
            .await;

        // 1 of 2 failed: 0.5 >= threshold
        assert_eq!(alerts.load(Ordering::SeqCst), 1);
        let health = cache.health_metrics();
        assert!(!health.is_healthy);
        assert!(health.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_monitoring_disabled_skips_alerts() {
        let store = Arc::new(InMemoryPersistentStore::new());
        let cache = DurableCache::new(
            store,
            DurableCacheConfig {
                max_retries: 0,
                enable_health_monitoring: false,
                ..fast_config()
            },
        );
        let alerts = Arc::new(AtomicUsize::new(0));
        let seen = alerts.clone();
        cache.on_health_alert(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let bad = Arc::new(AtomicUsize::new(0));
        let _ = cache
            .get("bad", flaky(bad, 100, json!(1)), DurableGetOptions::default())
            .await;

        assert_eq!(alerts.load(Ordering::SeqCst), 0);
        assert!(!cache.health_metrics().is_healthy);
    }

    #[tokio::test]
    async fn test_warm_cache_settles_all() {
        let store = Arc::new(InMemoryPersistentStore::new());
        let cache = DurableCache::new(
            store.clone(),
            DurableCacheConfig {
                max_retries: 0,
                ..fast_config()
            },
        );

        let entries = vec![
            DurableWarmEntry {
                key: "a".into(),
                fetcher: fetcher(|| async { Ok(json!("a")) }),
                tags: vec![],
                ttl: None,
            },
            DurableWarmEntry {
                key: "b".into(),
                fetcher: fetcher(|| async { Err(Error::Fetch("b".into())) }),
                tags: vec![],
                ttl: None,
            },
        ];

        let report = cache.warm_cache(entries).await;

        assert_eq!(report, WarmReport { succeeded: 1, failed: 1 });
        assert!(store.contains("a"));
        assert!(!store.contains("b"));
    }

    #[tokio::test]
    async fn test_reset_health_metrics() {
        let store = Arc::new(InMemoryPersistentStore::new());
        let cache = DurableCache::new(store, fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get("k", flaky(calls, 0, json!(1)), DurableGetOptions::default())
            .await
            .unwrap();

        cache.reset_health_metrics();

        let health = cache.health_metrics();
        assert_eq!(health.total_requests, 0);
        assert!(health.is_healthy);
        assert!(health.last_health_check.is_none());
    }
}
