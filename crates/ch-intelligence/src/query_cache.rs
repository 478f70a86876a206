//! Bounded, TTL-expiring cache for knowledge query results.
//!
//! Entries are keyed by a hash of the query text and its canonicalised
//! parameter map. Each read refreshes the entry's access time, which drives
//! both expiry (idle longer than the TTL) and LRU eviction at capacity.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use ch_core::config::QueryCacheConfig;

use crate::knowledge::QueryResult;

/// Deterministic key for `(query, params)`.
///
/// `params` is a `BTreeMap` and `serde_json` objects are sorted maps, so the
/// serialised form is canonical regardless of insertion order.
pub fn cache_key(query: &str, params: &BTreeMap<String, serde_json::Value>) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    serde_json::to_string(params)
        .unwrap_or_default()
        .hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: QueryResult,
    last_access: Instant,
    /// Tie-breaker for entries touched at the same instant.
    sequence: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: AHashMap<u64, CacheEntry>,
    stats: CacheStats,
    sequence: u64,
}

impl Inner {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

pub struct QueryCache {
    max_entries: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl QueryCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn from_config(config: &QueryCacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl())
    }

    pub async fn get(
        &self,
        query: &str,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Option<QueryResult> {
        let key = cache_key(query, params);
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let expired = match inner.entries.get(&key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => now.duration_since(entry.last_access) >= self.ttl,
        };

        if expired {
            inner.entries.remove(&key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            debug!(key, "query cache entry expired");
            return None;
        }

        let sequence = inner.next_sequence();
        inner.stats.hits += 1;
        let entry = inner.entries.get_mut(&key)?;
        entry.last_access = now;
        entry.sequence = sequence;
        Some(entry.value.clone())
    }

    pub async fn set(
        &self,
        query: &str,
        params: &BTreeMap<String, serde_json::Value>,
        value: QueryResult,
    ) {
        let key = cache_key(query, params);
        let mut inner = self.inner.lock().await;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            let lru = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.last_access, e.sequence))
                .map(|(k, _)| *k);
            if let Some(lru) = lru {
                inner.entries.remove(&lru);
                inner.stats.evictions += 1;
                debug!(key = lru, "query cache evicted least recently used entry");
            }
        }

        let sequence = inner.next_sequence();
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                last_access: Instant::now(),
                sequence,
            },
        );
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let mut stats = inner.stats.clone();
        stats.entries = inner.entries.len();
        stats
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every entry. Counters are kept.
    pub async fn clear(&self) {
        self.inner.lock().await.entries.clear();
    }
}
