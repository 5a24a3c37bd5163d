//! Multi-Tier Cache
//!
//! Layered read-through caching in front of an expensive data source.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        MultiTierCache                                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Memory tier          │ Durable tier          │ Query tier           │
//! │  ┌────────────────┐   │ ┌─────────────────┐   │ ┌────────────────┐   │
//! │  │ LRU + TTL map  │   │ │ PersistentStore │   │ │ QueryOptimizer │   │
//! │  │ tag index      │   │ │ retry + backoff │   │ │ result cache   │   │
//! │  │ expiry sweep   │   │ │ health alerts   │   │ │ batching       │   │
//! │  └────────────────┘   │ └─────────────────┘   │ └────────────────┘   │
//! │         │             │          │            │          │           │
//! │         └─────────────┴──────────┴────────────┴──────────┘           │
//! │                             │                                        │
//! │              memory → durable → direct fetch                         │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A read checks the memory tier, then asks the durable tier (which runs the
//! fetcher itself on a miss), then, when fallback is enabled, calls the
//! fetcher directly. Whatever is returned populates the memory tier.
//!
//! Values are `serde_json::Value` throughout; callers deserialize at the
//! edge.

mod durable;
mod entry;
pub mod keys;
mod manager;
mod memory;
mod metrics;
mod store;

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::error::Result;

pub use durable::{
    backoff_delay, CacheHealthMetrics, DurableCache, DurableCacheConfig, DurableGetOptions,
    DurableWarmEntry, HealthAlertCallback, WarmReport,
};
pub use entry::{tag_set, CacheEntry};
pub(crate) use entry::utf16_size;
pub use manager::{
    BatchGetOperation, CacheSource, GetOptions, InvalidationReport, MultiTierCache,
    MultiTierCacheConfig, MultiTierStats, SetOptions, WarmEntry,
};
pub use memory::{CacheStats, MemoryCache, MemoryCacheConfig};
pub use metrics::{LatencyTracker, OverallMetrics, OverallStats};
pub use store::{InMemoryPersistentStore, PersistOptions, PersistentStore, StoreStats};

/// Reusable value producer. Tiers may call it more than once (retries).
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`Fetcher`]
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// A fetcher that always yields `value`
pub fn constant(value: Value) -> Fetcher {
    fetcher(move || {
        let value = value.clone();
        async move { Ok(value) }
    })
}
