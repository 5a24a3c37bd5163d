//! Multi-Tier Cache Manager
//!
//! Composes the memory tier, the durable tier and the query optimizer
//! behind one get/set/delete/invalidate surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{join_all, try_join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::durable::{
    CacheHealthMetrics, DurableCache, DurableCacheConfig, DurableGetOptions, WarmReport,
};
use super::memory::{CacheStats, MemoryCache, MemoryCacheConfig};
use super::metrics::{LatencyTracker, OverallMetrics, OverallStats};
use super::store::{InMemoryPersistentStore, PersistentStore, StoreStats};
use super::{constant, fetcher, keys, Fetcher};
use crate::error::{Error, Result};
use crate::query::{
    CommunityParams, InsightPagination, PagedResult, PropertyFilters, QueryCacheStats,
    QueryExecutor, QueryOptimizer, QueryOptimizerConfig,
};

/// Composed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiTierCacheConfig {
    pub memory: MemoryCacheConfig,
    pub disk: DurableCacheConfig,
    pub query: QueryOptimizerConfig,
    /// Call the fetcher directly when the durable tier fails
    pub enable_fallback: bool,
    /// Log aggregated statistics every `stats_interval`
    pub enable_metrics: bool,
    #[serde(rename = "stats_interval_ms", with = "crate::config::duration_ms")]
    pub stats_interval: Duration,
}

impl Default for MultiTierCacheConfig {
    fn default() -> Self {
        Self {
            memory: MemoryCacheConfig::default(),
            disk: DurableCacheConfig::default(),
            query: QueryOptimizerConfig::default(),
            enable_fallback: true,
            enable_metrics: true,
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// Where a value was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheSource {
    Memory,
    Durable,
    /// Fetcher called directly after the durable tier failed
    Fetcher,
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheSource::Memory => write!(f, "memory"),
            CacheSource::Durable => write!(f, "durable"),
            CacheSource::Fetcher => write!(f, "fetcher"),
        }
    }
}

/// Per-call options for [`MultiTierCache::get`]
#[derive(Clone, Default)]
pub struct GetOptions {
    pub tags: Vec<String>,
    /// Memory-tier TTL, defaults to the memory config
    pub memory_ttl: Option<Duration>,
    /// Durable-tier revalidation age, defaults to the durable config
    pub disk_ttl: Option<Duration>,
    /// Alternate source handed to the durable tier once its retries are spent
    pub fallback: Option<Fetcher>,
}

impl GetOptions {
    pub fn tagged<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Options for [`MultiTierCache::set`]
pub type SetOptions = GetOptions;

/// One entry for [`MultiTierCache::warm_cache`]
#[derive(Clone)]
pub struct WarmEntry {
    pub key: String,
    pub fetcher: Fetcher,
    pub options: GetOptions,
}

/// One member of [`MultiTierCache::batch_get`]
#[derive(Clone)]
pub struct BatchGetOperation {
    pub key: String,
    pub fetcher: Fetcher,
    pub options: GetOptions,
}

/// Aggregated statistics of every tier
#[derive(Debug, Clone, Serialize)]
pub struct MultiTierStats {
    pub memory: CacheStats,
    pub durable: CacheHealthMetrics,
    /// Counters of the persistent store behind the durable tier
    pub store: StoreStats,
    pub query: QueryCacheStats,
    pub overall: OverallStats,
}

/// What a tag invalidation removed locally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub memory_entries: usize,
    pub query_results: usize,
    /// Every durable revalidation succeeded
    pub durable_ok: bool,
}

/// A resolution shared by every concurrent caller of one key
#[derive(Clone)]
struct InFlight {
    generation: u64,
    result: Shared<BoxFuture<'static, Result<(Value, CacheSource)>>>,
}

/// Removes its own `in_flight` entry when the resolution task ends,
/// whether it completes, fails or panics.
struct FlightGuard {
    inner: Arc<ManagerInner>,
    key: String,
    generation: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let generation = self.generation;
        self.inner
            .in_flight
            .remove_if(&self.key, |_, flight| flight.generation == generation);
    }
}

struct ManagerInner {
    config: MultiTierCacheConfig,
    memory: MemoryCache<Value>,
    durable: DurableCache,
    optimizer: QueryOptimizer,
    overall: OverallMetrics,
    in_flight: DashMap<String, InFlight>,
    next_flight: AtomicU64,
    monitoring: Mutex<Option<CancellationToken>>,
    alerts_wired: AtomicBool,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(token) = self.monitoring.get_mut().take() {
            token.cancel();
        }
    }
}

/// Multi-tier cache façade. Cheap to clone; clones share every tier.
#[derive(Clone)]
pub struct MultiTierCache {
    inner: Arc<ManagerInner>,
}

impl MultiTierCache {
    /// Wire the tiers over `store` and `executor`
    pub fn new(
        config: MultiTierCacheConfig,
        store: Arc<dyn PersistentStore>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        let inner = ManagerInner {
            memory: MemoryCache::with_config(config.memory.clone()),
            durable: DurableCache::new(store, config.disk.clone()),
            optimizer: QueryOptimizer::new(executor, config.query.clone()),
            overall: OverallMetrics::new(),
            in_flight: DashMap::new(),
            next_flight: AtomicU64::new(0),
            monitoring: Mutex::new(None),
            alerts_wired: AtomicBool::new(false),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Create with an in-process durable store (for testing)
    pub fn in_memory(config: MultiTierCacheConfig, executor: Arc<dyn QueryExecutor>) -> Self {
        Self::new(config, Arc::new(InMemoryPersistentStore::new()), executor)
    }

    /// Read `key` through memory, then durable, then the fetcher.
    ///
    /// Concurrent misses for one key share a single resolution.
    #[instrument(skip(self, fetcher, options))]
    pub async fn get(&self, key: &str, fetcher: Fetcher, options: GetOptions) -> Result<Value> {
        self.get_with_source(key, fetcher, options)
            .await
            .map(|(value, _)| value)
    }

    /// Like [`MultiTierCache::get`], also reporting which tier answered
    pub async fn get_with_source(
        &self,
        key: &str,
        fetcher: Fetcher,
        options: GetOptions,
    ) -> Result<(Value, CacheSource)> {
        let tracker = LatencyTracker::start();
        let overall = &self.inner.overall;
        overall.record_request();

        if let Some(value) = self.inner.memory.get(key) {
            overall.record_hit(tracker.elapsed());
            return Ok((value, CacheSource::Memory));
        }

        match self.resolve_shared(key, fetcher, options).await {
            Ok((value, CacheSource::Fetcher)) => {
                overall.record_direct_fetch(tracker.elapsed());
                Ok((value, CacheSource::Fetcher))
            }
            Ok((value, source)) => {
                overall.record_hit(tracker.elapsed());
                Ok((value, source))
            }
            Err(e) => {
                overall.record_error();
                Err(e)
            }
        }
    }

    /// Join the resolution in progress for `key`, or start one.
    ///
    /// The resolution runs as its own task, so it finishes and clears its
    /// map entry even when every caller stops waiting.
    async fn resolve_shared(
        &self,
        key: &str,
        fetcher: Fetcher,
        options: GetOptions,
    ) -> Result<(Value, CacheSource)> {
        let flight = self
            .inner
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| spawn_resolution(&self.inner, key, fetcher, options))
            .clone();

        flight.result.await
    }

    /// Write `value` to memory and through to the durable tier.
    ///
    /// Failures in either tier are logged, never returned. The durable write
    /// first revalidates `key`, then stores `value` via the durable read
    /// path; it is not an atomic replace.
    #[instrument(skip(self, value, options))]
    pub async fn set(&self, key: &str, value: Value, options: SetOptions) {
        if let Err(e) =
            self.inner
                .memory
                .set(key, value.clone(), options.memory_ttl, &options.tags)
        {
            warn!(key, error = %e, "memory write failed");
        }

        if let Err(e) = self.inner.durable.invalidate_key(key).await {
            warn!(key, error = %e, "durable revalidation before write failed");
        }
        let durable_options = DurableGetOptions {
            tags: options.tags,
            ttl: options.disk_ttl,
            fallback: None,
        };
        if let Err(e) = self
            .inner
            .durable
            .get(key, constant(value), durable_options)
            .await
        {
            warn!(key, error = %e, "durable write-through failed");
        }
    }

    /// Remove `key` from memory; durable revalidation is best effort
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.inner.memory.delete(key);
        if let Err(e) = self.inner.durable.invalidate_key(key).await {
            warn!(key, error = %e, "durable delete failed");
        }
        removed
    }

    /// Fan out to every tier. The memory tier is always invalidated.
    #[instrument(skip(self))]
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> InvalidationReport {
        let memory_entries = self.inner.memory.invalidate_by_tags(tags);

        let durable_ok = match self.inner.durable.invalidate_by_tags(tags).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "durable tag invalidation failed");
                false
            }
        };

        let mut query_results = 0;
        for tag in tags {
            match self.inner.optimizer.invalidate_cache(&regex::escape(tag)) {
                Ok(removed) => query_results += removed,
                Err(e) => warn!(tag = %tag, error = %e, "query cache invalidation failed"),
            }
        }

        debug!(memory_entries, query_results, durable_ok, "tags invalidated");
        InvalidationReport {
            memory_entries,
            query_results,
            durable_ok,
        }
    }

    /// Load every entry through [`MultiTierCache::get`]. Never fails as a whole.
    pub async fn warm_cache(&self, entries: Vec<WarmEntry>) -> WarmReport {
        let total = entries.len();
        let results = join_all(entries.into_iter().map(|entry| async move {
            let result = self.get(&entry.key, entry.fetcher, entry.options).await;
            if let Err(e) = &result {
                warn!(key = %entry.key, error = %e, "cache warm-up failed");
            }
            result.is_ok()
        }))
        .await;

        let succeeded = results.into_iter().filter(|ok| *ok).count();
        info!(succeeded, total, "cache warm-up finished");
        WarmReport {
            succeeded,
            failed: total - succeeded,
        }
    }

    /// Run several gets concurrently. One failure fails the whole call.
    pub async fn batch_get(
        &self,
        operations: Vec<BatchGetOperation>,
    ) -> Result<HashMap<String, Value>> {
        let results = try_join_all(operations.into_iter().map(|op| async move {
            let value = self.get(&op.key, op.fetcher, op.options).await?;
            Ok::<_, Error>((op.key, value))
        }))
        .await?;
        Ok(results.into_iter().collect())
    }

    /// Listings, cached under `properties:<filters>` and tagged `properties`
    pub async fn get_properties(&self, filters: &PropertyFilters) -> Result<Vec<Value>> {
        let key = keys::properties(filters)?;
        let optimizer = self.inner.optimizer.clone();
        let filters = filters.clone();
        let fetch = fetcher(move || {
            let optimizer = optimizer.clone();
            let filters = filters.clone();
            async move {
                let rows = optimizer.optimize_property_queries(&filters).await?;
                Ok(Value::Array(rows))
            }
        });

        let value = self
            .get(&key, fetch, GetOptions::tagged([keys::PROPERTIES]))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Communities, cached under `communities:<params>`
    pub async fn get_communities(&self, params: &CommunityParams) -> Result<Vec<Value>> {
        let key = keys::communities(params)?;
        let optimizer = self.inner.optimizer.clone();
        let params = params.clone();
        let fetch = fetcher(move || {
            let optimizer = optimizer.clone();
            let params = params.clone();
            async move {
                let rows = optimizer.optimize_community_queries(&params).await?;
                Ok(Value::Array(rows))
            }
        });

        let value = self
            .get(&key, fetch, GetOptions::tagged([keys::COMMUNITIES]))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// One page of insights, cached under `insights:<pagination>`
    pub async fn get_insights(&self, pagination: &InsightPagination) -> Result<PagedResult> {
        let key = keys::insights(pagination)?;
        let optimizer = self.inner.optimizer.clone();
        let pagination = pagination.clone();
        let fetch = fetcher(move || {
            let optimizer = optimizer.clone();
            let pagination = pagination.clone();
            async move {
                let page = optimizer.optimize_insight_queries(&pagination).await?;
                Ok(serde_json::to_value(page)?)
            }
        });

        let value = self
            .get(&key, fetch, GetOptions::tagged([keys::INSIGHTS]))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Aggregated statistics of every tier
    pub fn stats(&self) -> MultiTierStats {
        MultiTierStats {
            memory: self.inner.memory.stats(),
            durable: self.inner.durable.health_metrics(),
            store: self.inner.durable.store_stats(),
            query: self.inner.optimizer.cache_stats(),
            overall: self.inner.overall.snapshot(),
        }
    }

    /// Zero the façade counters, durable health and query metrics.
    /// Cached values are kept.
    pub fn reset_stats(&self) {
        self.inner.overall.reset();
        self.inner.durable.reset_health_metrics();
        self.inner.optimizer.clear_metrics();
    }

    /// Route durable health alerts and slow queries to the log, and start
    /// the periodic statistics log when metrics are enabled. Idempotent.
    pub fn setup_health_monitoring(&self) {
        if !self.inner.alerts_wired.swap(true, Ordering::SeqCst) {
            self.inner.durable.on_health_alert(|metrics| {
                warn!(
                    failure_rate = metrics.failure_rate,
                    failed = metrics.failed_requests,
                    total = metrics.total_requests,
                    "durable cache unhealthy"
                );
            });
            self.inner.optimizer.on_slow_query(|alert| {
                warn!(
                    query_id = %alert.query_id,
                    execution_ms = alert.execution_time.as_millis() as u64,
                    "slow query"
                );
            });
        }

        if self.inner.config.enable_metrics {
            let mut monitoring = self.inner.monitoring.lock();
            if monitoring.is_none() {
                *monitoring = spawn_stats_log(&self.inner);
            }
        }
    }

    /// Whether the periodic statistics log is running
    pub fn is_monitoring(&self) -> bool {
        self.inner.monitoring.lock().is_some()
    }

    /// Stop every background task. Tiers stay readable.
    pub fn destroy(&self) {
        if let Some(token) = self.inner.monitoring.lock().take() {
            token.cancel();
        }
        self.inner.memory.destroy();
        self.inner.optimizer.destroy();
        debug!("multi-tier cache destroyed");
    }

    pub fn memory(&self) -> &MemoryCache<Value> {
        &self.inner.memory
    }

    pub fn durable(&self) -> &DurableCache {
        &self.inner.durable
    }

    pub fn query_optimizer(&self) -> &QueryOptimizer {
        &self.inner.optimizer
    }

    pub fn config(&self) -> &MultiTierCacheConfig {
        &self.inner.config
    }

    /// Keys with a resolution in progress
    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.len()
    }
}

impl ManagerInner {
    async fn resolve(
        &self,
        key: &str,
        fetcher: Fetcher,
        options: GetOptions,
    ) -> Result<(Value, CacheSource)> {
        let durable_options = DurableGetOptions {
            tags: options.tags.clone(),
            ttl: options.disk_ttl,
            fallback: options.fallback.clone(),
        };

        match self.durable.get(key, fetcher.clone(), durable_options).await {
            Ok(value) => {
                self.populate_memory(key, &value, &options);
                Ok((value, CacheSource::Durable))
            }
            Err(e) if !self.config.enable_fallback => {
                error!(key, error = %e, "durable tier failed and fallback is disabled");
                Err(e)
            }
            Err(e) => {
                warn!(key, error = %e, "durable tier failed, calling fetcher directly");
                let value = fetcher().await.map_err(|e| {
                    error!(key, error = %e, "direct fetch failed");
                    e
                })?;
                self.populate_memory(key, &value, &options);
                Ok((value, CacheSource::Fetcher))
            }
        }
    }

    fn populate_memory(&self, key: &str, value: &Value, options: &GetOptions) {
        if let Err(e) = self
            .memory
            .set(key, value.clone(), options.memory_ttl, &options.tags)
        {
            warn!(key, error = %e, "memory population failed");
        }
    }

    fn log_stats(&self) {
        let memory = self.memory.stats();
        let durable = self.durable.health_metrics();
        let query = self.optimizer.cache_stats();
        let overall = self.overall.snapshot();

        info!(
            total_requests = overall.total_requests,
            hit_rate = overall.hit_rate,
            error_rate = overall.error_rate,
            avg_response_us = overall.avg_response_time.as_micros() as u64,
            memory_entries = memory.total_entries,
            memory_hit_rate = memory.hit_rate,
            durable_healthy = durable.is_healthy,
            durable_failure_rate = durable.failure_rate,
            query_cache_size = query.size,
            "cache statistics"
        );
    }
}

fn spawn_resolution(
    inner: &Arc<ManagerInner>,
    key: &str,
    fetcher: Fetcher,
    options: GetOptions,
) -> InFlight {
    let generation = inner.next_flight.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::clone(inner);
    let key = key.to_string();

    // The guard is built inside the task; the map shard is still locked here
    let task = tokio::spawn(async move {
        let guard = FlightGuard {
            inner,
            key,
            generation,
        };
        guard.inner.resolve(&guard.key, fetcher, options).await
    });

    let result = async move {
        task.await.unwrap_or_else(|e| {
            error!(error = %e, "cache resolution task aborted");
            Err(Error::Internal(format!("cache resolution aborted: {}", e)))
        })
    }
    .boxed()
    .shared();

    InFlight { generation, result }
}

fn spawn_stats_log(inner: &Arc<ManagerInner>) -> Option<CancellationToken> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let weak: Weak<ManagerInner> = Arc::downgrade(inner);
    let period = inner.config.stats_interval;

    handle.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.log_stats();
                }
            }
        }
    });

    Some(token)
}

// =============================================================================
// Tests
// =============================================================================
