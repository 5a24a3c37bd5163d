//! Memory Cache - process-local hot tier
//!
//! Bounded key/value store with LRU + TTL eviction and hit/miss statistics.
//!
//! # Design
//!
//! - One mutex-guarded map of entries plus an access-order map of
//!   monotonically increasing markers (lowest marker = least recently used)
//! - Eviction scans for the lowest marker: O(n) worst case, bounded by
//!   `max_size`
//! - Expiry is detected lazily on `get`/`has` and by a background sweep
//!   running every `cleanup_interval`
//! - `max_size == 0` turns `set` into a no-op

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::entry::CacheEntry;
use super::metrics::LatencyTracker;
use crate::error::{Error, Result};

/// Memory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries (0 = never store)
    pub max_size: usize,
    /// TTL applied when `set` is called without one
    #[serde(rename = "default_ttl_ms", with = "crate::config::duration_ms")]
    pub default_ttl: Duration,
    /// Interval between background expiry sweeps
    #[serde(rename = "cleanup_interval_ms", with = "crate::config::duration_ms")]
    pub cleanup_interval: Duration,
    /// Track hits, misses and read latency
    pub enable_stats: bool,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(60),
            enable_stats: true,
        }
    }
}

/// Memory cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Entries currently stored (including not-yet-swept expired ones)
    pub total_entries: usize,
    /// hits / (hits + misses), 0 before the first lookup
    pub hit_rate: f64,
    /// 1 - hit_rate, 0 before the first lookup
    pub miss_rate: f64,
    /// Estimated bytes held
    pub memory_usage: u64,
    /// Average `get` latency
    pub avg_response_time: Duration,
    /// Entries removed to make room
    pub eviction_count: u64,
    /// Entries removed because their TTL passed
    pub expired_count: u64,
    /// Raw hit count
    pub hits: u64,
    /// Raw miss count
    pub misses: u64,
}

/// Entry map plus LRU bookkeeping
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    access_order: HashMap<String, u64>,
    access_counter: u64,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            access_order: HashMap::new(),
            access_counter: 0,
        }
    }

    fn touch(&mut self, key: &str) {
        self.access_counter += 1;
        self.access_order
            .insert(key.to_string(), self.access_counter);
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        self.access_order.remove(key);
        self.entries.remove(key)
    }

    /// Key with the lowest access marker
    fn lru_key(&self) -> Option<String> {
        self.access_order
            .iter()
            .min_by_key(|(_, marker)| **marker)
            .map(|(key, _)| key.clone())
    }
}

struct MemoryCacheInner<V> {
    state: Mutex<CacheState<V>>,
    config: MemoryCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    /// Sum of `get` latencies in nanoseconds
    response_time_ns: AtomicU64,
    timed_reads: AtomicU64,
}

impl<V> MemoryCacheInner<V> {
    fn record_read(&self, hit: bool, tracker: &LatencyTracker) {
        if !self.config.enable_stats {
            return;
        }
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.response_time_ns
            .fetch_add(tracker.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.timed_reads.fetch_add(1, Ordering::Relaxed);
    }

    fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        drop(state);

        self.expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }
}

/// Memory cache - the hot tier
pub struct MemoryCache<V> {
    inner: Arc<MemoryCacheInner<V>>,
    /// Stops the background sweep
    cleanup: Mutex<Option<CancellationToken>>,
}

impl<V> MemoryCache<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Create a new memory cache with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryCacheConfig::default())
    }

    /// Create a new memory cache with custom configuration.
    ///
    /// The expiry sweep is spawned on the current tokio runtime; outside a
    /// runtime it is skipped and [`MemoryCache::cleanup_expired`] must be
    /// driven by the caller.
    pub fn with_config(config: MemoryCacheConfig) -> Self {
        let inner = Arc::new(MemoryCacheInner {
            state: Mutex::new(CacheState::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            response_time_ns: AtomicU64::new(0),
            timed_reads: AtomicU64::new(0),
        });
        let cleanup = spawn_cleanup(&inner);

        Self {
            inner,
            cleanup: Mutex::new(cleanup),
        }
    }

    /// Get a value, or `None` on absence or expiry
    pub fn get(&self, key: &str) -> Option<V> {
        let tracker = LatencyTracker::start();
        let mut state = self.inner.state.lock();

        let expired = match state.entries.get(key).map(|e| e.is_expired()) {
            None => {
                drop(state);
                self.inner.record_read(false, &tracker);
                return None;
            }
            Some(expired) => expired,
        };

        if expired {
            state.remove(key);
            drop(state);
            self.inner.expired.fetch_add(1, Ordering::Relaxed);
            self.inner.record_read(false, &tracker);
            trace!(key, "memory entry expired on read");
            return None;
        }

        state.touch(key);
        let value = state.entries.get_mut(key).map(|entry| {
            entry.record_access();
            entry.value.clone()
        });
        drop(state);

        self.inner.record_read(value.is_some(), &tracker);
        value
    }

    /// Store a value.
    ///
    /// `ttl` defaults to the configured TTL. When the cache is full and the
    /// key is new, the least recently used entry is evicted first.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>, tags: &[String]) -> Result<()> {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        if ttl.is_zero() {
            return Err(Error::InvalidTtl(format!(
                "entry '{}' would expire on creation",
                key
            )));
        }

        let max_size = self.inner.config.max_size;
        if max_size == 0 {
            return Ok(());
        }

        let entry = CacheEntry::new(key, value, ttl, tags.iter().cloned().collect());
        let mut state = self.inner.state.lock();

        if !state.entries.contains_key(key) && state.entries.len() >= max_size {
            if let Some(victim) = state.lru_key() {
                state.remove(&victim);
                self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(key = %victim, "evicted least recently used entry");
            }
        }

        state.entries.insert(key.to_string(), entry);
        state.touch(key);
        Ok(())
    }

    /// Remove an entry
    pub fn delete(&self, key: &str) -> bool {
        self.inner.state.lock().remove(key).is_some()
    }

    /// Check presence without counting a hit or refreshing recency
    pub fn has(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        let expired = match state.entries.get(key).map(|e| e.is_expired()) {
            None => return false,
            Some(expired) => expired,
        };

        if expired {
            state.remove(key);
            self.inner.expired.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Remove every entry carrying at least one of `tags`
    pub fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        if tags.is_empty() {
            return 0;
        }
        let wanted: HashSet<&str> = tags.iter().map(String::as_str).collect();

        let mut state = self.inner.state.lock();
        let doomed: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.has_any_tag(&wanted))
            .map(|e| e.key.clone())
            .collect();

        for key in &doomed {
            state.remove(key);
        }

        debug!(tags = ?tags, removed = doomed.len(), "memory tag invalidation");
        doomed.len()
    }

    /// Drop all entries and reset statistics
    pub fn clear(&self) {
        *self.inner.state.lock() = CacheState::new();
        self.inner.hits.store(0, Ordering::Relaxed);
        self.inner.misses.store(0, Ordering::Relaxed);
        self.inner.evictions.store(0, Ordering::Relaxed);
        self.inner.expired.store(0, Ordering::Relaxed);
        self.inner.response_time_ns.store(0, Ordering::Relaxed);
        self.inner.timed_reads.store(0, Ordering::Relaxed);
    }

    /// Sweep expired entries now; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        self.inner.cleanup_expired()
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently stored
    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().entries.keys().cloned().collect()
    }

    /// Get configuration
    pub fn config(&self) -> &MemoryCacheConfig {
        &self.inner.config
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let (total_entries, memory_usage) = {
            let state = self.inner.state.lock();
            let usage = state.entries.values().map(|e| e.estimated_size()).sum();
            (state.entries.len(), usage)
        };

        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let (hit_rate, miss_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            let rate = hits as f64 / total as f64;
            (rate, 1.0 - rate)
        };

        let timed = self.inner.timed_reads.load(Ordering::Relaxed);
        let avg_response_time = if timed == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.inner.response_time_ns.load(Ordering::Relaxed) / timed)
        };

        CacheStats {
            total_entries,
            hit_rate,
            miss_rate,
            memory_usage,
            avg_response_time,
            eviction_count: self.inner.evictions.load(Ordering::Relaxed),
            expired_count: self.inner.expired.load(Ordering::Relaxed),
            hits,
            misses,
        }
    }

    /// Stop the background sweep. Entries stay readable.
    pub fn destroy(&self) {
        if let Some(token) = self.cleanup.lock().take() {
            token.cancel();
            debug!("memory cache sweep stopped");
        }
    }

    /// Whether the background sweep is running
    pub fn is_sweeping(&self) -> bool {
        self.cleanup.lock().is_some()
    }
}

impl<V> Default for MemoryCache<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for MemoryCache<V> {
    fn drop(&mut self) {
        if let Some(token) = self.cleanup.get_mut().take() {
            token.cancel();
        }
    }
}

fn spawn_cleanup<V>(inner: &Arc<MemoryCacheInner<V>>) -> Option<CancellationToken>
where
    V: Send + Sync + 'static,
{
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let weak: Weak<MemoryCacheInner<V>> = Arc::downgrade(inner);
    let period = inner.config.cleanup_interval;

    handle.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    let removed = inner.cleanup_expired();
                    if removed > 0 {
                        debug!(removed, "swept expired memory entries");
                    }
                }
            }
        }
    });

    Some(token)
}

// =============================================================================
// Tests
// =============================================================================
