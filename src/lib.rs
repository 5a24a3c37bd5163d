//! tiercache - Multi-Tier Read-Through Cache
//!
//! Layered caching in front of an expensive data source: a bounded in-process
//! memory tier, a retrying and health-monitored durable tier over a pluggable
//! persistent store, and a query tier that caches parametrized reads against
//! a relational store.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ MultiTierCache ──▶ MemoryCache ──miss──▶ DurableCache ──▶ PersistentStore
//!                  │                                       │
//!                  │                                  fail + fallback
//!                  │                                       ▼
//!                  └──── get_properties / ... ──▶ QueryOptimizer ──▶ QueryExecutor
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Memory and durable tiers, the multi-tier façade, key helpers
//! - [`query`] - Query builder, optimizer and batching
//! - [`monitoring`] - Prometheus exposition of cache statistics
//! - [`config`] - YAML configuration loading and validation
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod query;

// Re-export commonly used types
pub use cache::{
    fetcher, Fetcher, GetOptions, MemoryCache, MultiTierCache, MultiTierCacheConfig,
    MultiTierStats, PersistentStore,
};
pub use error::{Error, Result};
pub use query::{QueryExecutor, QueryOptimizer};
