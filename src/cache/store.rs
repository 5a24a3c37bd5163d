//! Persistent Store - durable substrate port
//!
//! The durable tier never talks to a concrete backend. It drives a
//! [`PersistentStore`]: a keyed get-or-fetch primitive with tag
//! revalidation, which any shared cache (Redis, a CDN data cache, a
//! framework data cache) can implement.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use super::Fetcher;
use crate::error::Result;

/// Options attached to a single store access
#[derive(Debug, Clone)]
pub struct PersistOptions {
    /// Tags the stored value can later be revalidated by
    pub tags: Vec<String>,
    /// Revalidate the value once it is older than this
    pub ttl: Duration,
}

/// Durable substrate trait
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Return the stored value for `key`, or run `fetcher`, store its
    /// result under `options.tags` and return it.
    async fn get_or_fetch(
        &self,
        key: &str,
        fetcher: Fetcher,
        options: &PersistOptions,
    ) -> Result<Value>;

    /// Mark every value tagged `tag` stale. Idempotent.
    async fn revalidate_tag(&self, tag: &str) -> Result<()>;

    /// Get storage statistics
    fn stats(&self) -> StoreStats;
}

/// Store statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    /// Values currently stored
    pub entry_count: u64,
    /// Reads answered from stored values
    pub hits: u64,
    /// Fetcher invocations
    pub fetches: u64,
    /// Tag revalidations
    pub revalidations: u64,
}

struct StoredValue {
    value: Value,
    tags: HashSet<String>,
    stored_at: Instant,
    ttl: Duration,
}

impl StoredValue {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

/// In-memory store for testing and single-process deployments
#[derive(Default)]
pub struct InMemoryPersistentStore {
    entries: DashMap<String, StoredValue>,
    hits: AtomicU64,
    fetches: AtomicU64,
    revalidations: AtomicU64,
}

impl InMemoryPersistentStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a fresh value is stored for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| e.is_fresh())
            .unwrap_or(false)
    }

    /// Seed a value directly, bypassing any fetcher
    pub fn insert(&self, key: &str, value: Value, tags: &[String], ttl: Duration) {
        let mut tags: HashSet<String> = tags.iter().cloned().collect();
        tags.insert(key.to_string());
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                tags,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }
}

#[async_trait]
impl PersistentStore for InMemoryPersistentStore {
    async fn get_or_fetch(
        &self,
        key: &str,
        fetcher: Fetcher,
        options: &PersistOptions,
    ) -> Result<Value> {
        if let Some(stored) = self.entries.get(key) {
            if stored.is_fresh() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(stored.value.clone());
            }
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        // Failed fetches are never stored
        let value = fetcher().await?;

        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                tags: options.tags.iter().cloned().collect(),
                stored_at: Instant::now(),
                ttl: options.ttl,
            },
        );
        Ok(value)
    }

    async fn revalidate_tag(&self, tag: &str) -> Result<()> {
        self.revalidations.fetch_add(1, Ordering::Relaxed);
        self.entries.retain(|_, stored| !stored.tags.contains(tag));
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            entry_count: self.entries.len() as u64,
            hits: self.hits.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fetcher;
    use crate::error::Error;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn options(tags: &[&str], ttl: Duration) -> PersistOptions {
        PersistOptions {
            tags: tags.iter().map(|s| s.to_string()).collect(),
            ttl,
        }
    }

    fn counting(calls: Arc<AtomicUsize>, value: Value) -> Fetcher {
        fetcher(move || {
            let calls = calls.clone();
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        })
    }

    #[tokio::test]
    async fn test_fetch_then_serve_stored() {
        let store = InMemoryPersistentStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let opts = options(&["k"], Duration::from_secs(60));

        let first = store
            .get_or_fetch("k", counting(calls.clone(), json!(1)), &opts)
            .await
            .unwrap();
        let second = store
            .get_or_fetch("k", counting(calls.clone(), json!(2)), &opts)
            .await
            .unwrap();

        assert_eq!(first, json!(1));
        assert_eq!(second, json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_stale_value_is_refetched() {
        let store = InMemoryPersistentStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let opts = options(&[], Duration::from_millis(10));

        store
            .get_or_fetch("k", counting(calls.clone(), json!(1)), &opts)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let value = store
            .get_or_fetch("k", counting(calls.clone(), json!(2)), &opts)
            .await
            .unwrap();

        assert_eq!(value, json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_revalidate_tag_is_idempotent() {
        let store = InMemoryPersistentStore::new();
        store.insert("a", json!("a"), &["listing".to_string()], Duration::from_secs(60));
        store.insert("b", json!("b"), &[], Duration::from_secs(60));

        store.revalidate_tag("listing").await.unwrap();
        store.revalidate_tag("listing").await.unwrap();

        assert!(!store.contains("a"));
        assert!(store.contains("b"));
        assert_eq!(store.stats().revalidations, 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_not_stored() {
        let store = InMemoryPersistentStore::new();
        let opts = options(&[], Duration::from_secs(60));
        let failing = fetcher(|| async { Err(Error::Fetch("down".into())) });

        let err = store.get_or_fetch("k", failing, &opts).await.unwrap_err();

        assert_eq!(err, Error::Fetch("down".into()));
        assert!(!store.contains("k"));
        assert_eq!(store.stats().entry_count, 0);
    }
}
