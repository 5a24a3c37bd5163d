//! Query Optimizer
//!
//! Executes the three read shapes through a [`QueryExecutor`] with:
//! - A result cache keyed by `"<entity>:<filters as JSON>"`
//! - A bounded ring buffer of per-query performance metrics
//! - Slow-query alerts
//! - A semaphore sized to the connection pool

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::batch::BatchQueue;
use super::builder::{
    build_community_query, build_insight_queries, build_property_query, CommunityParams,
    InsightPagination, PropertyFilters, QueryType, SqlQuery,
};
use super::executor::QueryExecutor;
use crate::cache::utf16_size;
use crate::error::{Error, Result};

/// Retained performance metrics
pub const METRICS_CAPACITY: usize = 1000;

/// Metrics older than this are pruned
pub const METRICS_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const METRICS_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptimizerConfig {
    #[serde(rename = "slow_query_threshold_ms", with = "crate::config::duration_ms")]
    pub slow_query_threshold: Duration,
    /// Items per batch for both batching paths
    pub batch_size: usize,
    /// Maximum wait before a partial `add_to_batch` queue is flushed
    #[serde(rename = "batch_timeout_ms", with = "crate::config::duration_ms")]
    pub batch_timeout: Duration,
    pub enable_query_cache: bool,
    /// Lifetime of a cached result
    #[serde(rename = "cache_timeout_ms", with = "crate::config::duration_ms")]
    pub cache_timeout: Duration,
    pub enable_performance_monitoring: bool,
    /// Concurrent executor calls
    pub connection_pool_size: usize,
}

impl Default for QueryOptimizerConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: Duration::from_secs(1),
            batch_size: 10,
            batch_timeout: Duration::from_millis(50),
            enable_query_cache: true,
            cache_timeout: Duration::from_secs(5 * 60),
            enable_performance_monitoring: true,
            connection_pool_size: 10,
        }
    }
}

/// One recorded query
#[derive(Debug, Clone, Serialize)]
pub struct QueryPerformanceMetrics {
    pub query_id: String,
    /// Zero for cache hits
    pub execution_time: Duration,
    pub rows_affected: usize,
    pub cache_hit: bool,
    pub timestamp: DateTime<Utc>,
    pub query_type: QueryType,
    pub table_name: String,
}

/// Raised when an execution exceeds `slow_query_threshold`
#[derive(Debug, Clone, Serialize)]
pub struct SlowQueryAlert {
    pub query_id: String,
    pub execution_time: Duration,
    pub threshold: Duration,
    /// SQL text without bound values
    pub query: String,
    pub timestamp: DateTime<Utc>,
}

pub type SlowQueryCallback = Arc<dyn Fn(&SlowQueryAlert) + Send + Sync>;

/// Cached query result
#[derive(Debug, Clone)]
pub struct QueryCacheEntry {
    pub data: Value,
    pub timestamp: Instant,
    pub expires_at: Instant,
    pub hit_count: u64,
}

/// Result cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryCacheStats {
    pub size: usize,
    /// Fraction of retained metrics that were cache hits
    pub hit_rate: f64,
    /// Sum of per-entry hit counts
    pub total_hits: u64,
    /// Estimated bytes, two per UTF-16 unit of key and JSON
    pub memory_usage: usize,
}

/// One page of rows plus the unpaged total
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedResult {
    pub data: Vec<Value>,
    pub total: u64,
}

pub(crate) struct OptimizerInner {
    pub(crate) config: QueryOptimizerConfig,
    executor: Arc<dyn QueryExecutor>,
    cache: Mutex<HashMap<String, QueryCacheEntry>>,
    metrics: Mutex<VecDeque<QueryPerformanceMetrics>>,
    slow_query_callbacks: RwLock<Vec<SlowQueryCallback>>,
    pool: Semaphore,
    pub(crate) batch_queue: Mutex<BatchQueue>,
    pub(crate) shutdown: CancellationToken,
}

impl Drop for OptimizerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Cached, measured access to the relational store
#[derive(Clone)]
pub struct QueryOptimizer {
    pub(crate) inner: Arc<OptimizerInner>,
}

impl QueryOptimizer {
    /// Create an optimizer over `executor`.
    ///
    /// The hourly metrics prune is spawned on the current tokio runtime when
    /// one exists.
    pub fn new(executor: Arc<dyn QueryExecutor>, config: QueryOptimizerConfig) -> Self {
        let inner = Arc::new(OptimizerInner {
            pool: Semaphore::new(config.connection_pool_size.max(1)),
            config,
            executor,
            cache: Mutex::new(HashMap::new()),
            metrics: Mutex::new(VecDeque::with_capacity(METRICS_CAPACITY)),
            slow_query_callbacks: RwLock::new(Vec::new()),
            batch_queue: Mutex::new(BatchQueue::default()),
            shutdown: CancellationToken::new(),
        });
        spawn_metrics_prune(&inner);
        Self { inner }
    }

    pub fn config(&self) -> &QueryOptimizerConfig {
        &self.inner.config
    }

    /// Listings matching `filters`
    #[instrument(skip(self, filters))]
    pub async fn optimize_property_queries(&self, filters: &PropertyFilters) -> Result<Vec<Value>> {
        let key = format!("properties:{}", serde_json::to_string(filters)?);
        let query = build_property_query(filters);
        self.cached_rows(key, query).await
    }

    /// Communities matching `params`
    #[instrument(skip(self, params))]
    pub async fn optimize_community_queries(&self, params: &CommunityParams) -> Result<Vec<Value>> {
        let key = format!("communities:{}", serde_json::to_string(params)?);
        let query = build_community_query(params);
        self.cached_rows(key, query).await
    }

    /// One page of market insights; data and COUNT run concurrently
    #[instrument(skip(self, pagination))]
    pub async fn optimize_insight_queries(
        &self,
        pagination: &InsightPagination,
    ) -> Result<PagedResult> {
        let key = format!("insights:{}", serde_json::to_string(pagination)?);
        let (data_query, count_query) = build_insight_queries(pagination);

        if let Some(hit) = self.inner.cache_lookup(&key) {
            self.inner.record_cache_hit(&data_query);
            return Ok(serde_json::from_value(hit)?);
        }

        let start = Instant::now();
        let (data, count) = tokio::try_join!(
            self.inner.run(&data_query),
            self.inner.run(&count_query)
        )?;
        let total = count
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.inner
            .record_execution(&data_query, start.elapsed(), data.len());

        let page = PagedResult { data, total };
        self.inner.cache_store(key, serde_json::to_value(&page)?);
        Ok(page)
    }

    async fn cached_rows(&self, key: String, query: SqlQuery) -> Result<Vec<Value>> {
        if let Some(hit) = self.inner.cache_lookup(&key) {
            self.inner.record_cache_hit(&query);
            return Ok(serde_json::from_value(hit)?);
        }

        let start = Instant::now();
        let rows = self.inner.run(&query).await?;
        self.inner.record_execution(&query, start.elapsed(), rows.len());

        self.inner.cache_store(key, Value::Array(rows.clone()));
        Ok(rows)
    }

    /// Register a slow-query callback
    pub fn on_slow_query<F>(&self, callback: F)
    where
        F: Fn(&SlowQueryAlert) + Send + Sync + 'static,
    {
        self.inner.slow_query_callbacks.write().push(Arc::new(callback));
    }

    /// Remove cached results whose key matches `pattern`
    pub fn invalidate_cache(&self, pattern: &str) -> Result<usize> {
        let regex = Regex::new(pattern)?;
        let mut cache = self.inner.cache.lock();
        let before = cache.len();
        cache.retain(|key, _| !regex.is_match(key));
        let removed = before - cache.len();
        debug!(pattern, removed, "query cache invalidated");
        Ok(removed)
    }

    pub fn clear_cache(&self) {
        self.inner.cache.lock().clear();
    }

    pub fn cache_stats(&self) -> QueryCacheStats {
        let (size, total_hits, memory_usage) = {
            let cache = self.inner.cache.lock();
            let total_hits = cache.values().map(|e| e.hit_count).sum();
            let memory_usage = cache
                .iter()
                .map(|(key, entry)| utf16_size(key) + utf16_size(&entry.data.to_string()))
                .sum();
            (cache.len(), total_hits, memory_usage)
        };

        let metrics = self.inner.metrics.lock();
        let hit_rate = if metrics.is_empty() {
            0.0
        } else {
            metrics.iter().filter(|m| m.cache_hit).count() as f64 / metrics.len() as f64
        };

        QueryCacheStats {
            size,
            hit_rate,
            total_hits,
            memory_usage,
        }
    }

    /// Copy of the retained metrics, oldest first
    pub fn performance_metrics(&self) -> Vec<QueryPerformanceMetrics> {
        self.inner.metrics.lock().iter().cloned().collect()
    }

    pub fn clear_metrics(&self) {
        self.inner.metrics.lock().clear();
    }

    /// Drop metrics older than `max_age`, returning how many were removed
    pub fn prune_metrics(&self, max_age: Duration) -> usize {
        self.inner.prune_metrics(max_age)
    }

    /// Stop background work and cancel queued `add_to_batch` items
    pub fn destroy(&self) {
        self.inner.shutdown.cancel();
        let cancelled = self.inner.batch_queue.lock().drain();
        if !cancelled.is_empty() {
            warn!(count = cancelled.len(), "cancelling queued batch items");
        }
        // Dropping the responders fails the waiting callers
        drop(cancelled);
    }
}

impl OptimizerInner {
    async fn run(&self, query: &SqlQuery) -> Result<Vec<Value>> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| Error::Internal("connection pool closed".to_string()))?;
        self.executor.execute(query).await.map_err(|e| {
            error!(table = %query.table, error = %e, "query execution failed");
            e
        })
    }

    fn cache_lookup(&self, key: &str) -> Option<Value> {
        if !self.config.enable_query_cache {
            return None;
        }
        let mut cache = self.cache.lock();
        let expired = match cache.get_mut(key) {
            None => return None,
            Some(entry) if Instant::now() < entry.expires_at => {
                entry.hit_count += 1;
                return Some(entry.data.clone());
            }
            Some(_) => true,
        };
        if expired {
            cache.remove(key);
        }
        None
    }

    fn cache_store(&self, key: String, data: Value) {
        if !self.config.enable_query_cache {
            return;
        }
        let now = Instant::now();
        self.cache.lock().insert(
            key,
            QueryCacheEntry {
                data,
                timestamp: now,
                expires_at: now + self.config.cache_timeout,
                hit_count: 0,
            },
        );
    }

    fn record_cache_hit(&self, query: &SqlQuery) {
        self.push_metric(QueryPerformanceMetrics {
            query_id: Uuid::new_v4().to_string(),
            execution_time: Duration::ZERO,
            rows_affected: 0,
            cache_hit: true,
            timestamp: Utc::now(),
            query_type: query.query_type,
            table_name: query.table.clone(),
        });
    }

    fn record_execution(&self, query: &SqlQuery, execution_time: Duration, rows: usize) {
        let query_id = Uuid::new_v4().to_string();

        if execution_time > self.config.slow_query_threshold {
            self.raise_slow_query(SlowQueryAlert {
                query_id: query_id.clone(),
                execution_time,
                threshold: self.config.slow_query_threshold,
                query: query.sql.clone(),
                timestamp: Utc::now(),
            });
        }

        self.push_metric(QueryPerformanceMetrics {
            query_id,
            execution_time,
            rows_affected: rows,
            cache_hit: false,
            timestamp: Utc::now(),
            query_type: query.query_type,
            table_name: query.table.clone(),
        });
    }

    fn push_metric(&self, metric: QueryPerformanceMetrics) {
        if !self.config.enable_performance_monitoring {
            return;
        }
        let mut metrics = self.metrics.lock();
        if metrics.len() >= METRICS_CAPACITY {
            metrics.pop_front();
        }
        metrics.push_back(metric);
    }

    fn raise_slow_query(&self, alert: SlowQueryAlert) {
        warn!(
            query_id = %alert.query_id,
            execution_ms = alert.execution_time.as_millis() as u64,
            threshold_ms = alert.threshold.as_millis() as u64,
            "slow query detected"
        );

        let callbacks = self.slow_query_callbacks.read().clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&alert))).is_err() {
                error!(query_id = %alert.query_id, "slow query callback panicked");
            }
        }
    }

    fn prune_metrics(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut metrics = self.metrics.lock();
        let before = metrics.len();
        metrics.retain(|m| {
            (now - m.timestamp)
                .to_std()
                .map(|age| age <= max_age)
                .unwrap_or(true)
        });
        before - metrics.len()
    }
}

fn spawn_metrics_prune(inner: &Arc<OptimizerInner>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let cancelled = inner.shutdown.clone();
    let weak: Weak<OptimizerInner> = Arc::downgrade(inner);

    handle.spawn(async move {
        let mut ticker = tokio::time::interval(METRICS_PRUNE_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    let removed = inner.prune_metrics(METRICS_MAX_AGE);
                    if removed > 0 {
                        debug!(removed, "pruned query metrics");
                    }
                }
            }
        }
    });
}

// =============================================================================
// Tests
// =============================================================================
