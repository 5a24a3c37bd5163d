//! Cache Entry Types
//!
//! Entries held by the memory tier, with TTL bookkeeping and the
//! deterministic size heuristic used for memory-usage reporting.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::Serialize;

/// A single memory-tier entry
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Entry key
    pub key: String,
    /// Cached value
    pub value: V,
    /// When the entry was stored
    pub created_at: Instant,
    /// When the entry stops being served (always after `created_at`)
    pub expires_at: Instant,
    /// Last successful read
    pub last_accessed: Instant,
    /// Successful reads since the entry was stored
    pub hit_count: u64,
    /// Labels for group invalidation
    pub tags: HashSet<String>,
}

impl<V> CacheEntry<V> {
    /// Create a new entry expiring `ttl` from now
    pub fn new(key: impl Into<String>, value: V, ttl: Duration, tags: HashSet<String>) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            value,
            created_at: now,
            expires_at: now + ttl,
            last_accessed: now,
            hit_count: 0,
            tags,
        }
    }

    /// Check if entry has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Check expiry against a fixed instant (sweeps use one `now` per pass)
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Record a successful read
    #[inline]
    pub fn record_access(&mut self) {
        self.last_accessed = Instant::now();
        self.hit_count += 1;
    }

    /// Remaining lifetime, zero once expired
    pub fn ttl_remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Whether any of `tags` is attached to this entry
    pub fn has_any_tag(&self, tags: &HashSet<&str>) -> bool {
        self.tags.iter().any(|t| tags.contains(t.as_str()))
    }
}

impl<V: Serialize> CacheEntry<V> {
    /// Estimated footprint in bytes.
    ///
    /// Two bytes per UTF-16 code unit of key, JSON-encoded value and tags.
    /// Values that fail to serialize count as zero.
    pub fn estimated_size(&self) -> u64 {
        let value_size = serde_json::to_string(&self.value)
            .map(|s| utf16_size(&s))
            .unwrap_or(0);
        let tags_size: usize = self.tags.iter().map(|t| utf16_size(t)).sum();
        (utf16_size(&self.key) + value_size + tags_size) as u64
    }
}

/// Bytes `s` would occupy as UTF-16
pub(crate) fn utf16_size(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

/// Build a tag set from any list of string-likes
pub fn tag_set<I, S>(tags: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tags.into_iter().map(Into::into).collect()
}

// =============================================================================
// Tests
// =============================================================================
