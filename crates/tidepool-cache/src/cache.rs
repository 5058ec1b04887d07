//! Query-result cache with TTL expiry, size-bounded LRU eviction, and tag /
//! glob invalidation.
//!
//! The cache never learns about writes on its own. Callers that modify data
//! are responsible for calling [`QueryCache::invalidate_by_tag`] or
//! [`QueryCache::invalidate_by_pattern`] afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use tidepool_core::{CacheConfig, QueryResult};

use crate::key::{is_write_statement, query_of};
use crate::lru::LruList;

/// Longest lifetime an entry can be given; larger TTLs are capped.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid invalidation pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Approximate memory footprint used for size accounting.
pub trait Weigh {
    fn weight(&self) -> usize;
}

impl Weigh for QueryResult {
    fn weight(&self) -> usize {
        self.size_bytes()
    }
}

impl Weigh for String {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl Weigh for Vec<u8> {
    fn weight(&self) -> usize {
        self.len()
    }
}

/// Cache-aside contract consumed by the executor.
pub trait Cacheable<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<Arc<V>>;

    /// Store `value`; returns `false` when the entry was rejected.
    fn set(&self, key: &str, value: V, ttl: Option<Duration>, tags: &[String]) -> bool;

    fn invalidate(&self, key: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub rejections: u64,
    pub entries: usize,
    pub size_bytes: usize,
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

/// Snapshot of one entry, from [`QueryCache::entry_info`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub size: usize,
    pub age: Duration,
    pub idle: Duration,
    pub ttl_remaining: Duration,
    pub tags: Vec<String>,
}

struct CacheEntry<V> {
    value: Arc<V>,
    size: usize,
    created_at: Instant,
    expires_at: Instant,
    last_accessed_at: Instant,
    tags: Vec<String>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

struct CacheState<V> {
    entries: LruList<CacheEntry<V>>,
    tags: HashMap<String, HashSet<String>>,
    size: usize,
    stats: CacheStats,
}

impl<V> CacheState<V> {
    fn forget_tags(&mut self, key: &str, tags: &[String]) {
        for tag in tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.size -= entry.size;
        self.forget_tags(key, &entry.tags);
        Some(entry)
    }
}

/// Thread-safe TTL + LRU cache. All operations run under one short lock and
/// never perform I/O.
pub struct QueryCache<V = QueryResult> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
}

impl<V> std::fmt::Debug for QueryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("QueryCache")
            .field("entries", &st.entries.len())
            .field("size", &st.size)
            .field("max_size", &self.config.max_size)
            .finish()
    }
}

impl<V: Weigh> QueryCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: LruList::new(),
                tags: HashMap::new(),
                size: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `key`. Expired entries count as a miss and are removed.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        match st.entries.get_mut(key) {
            None => {
                st.stats.misses += 1;
                None
            }
            Some(entry) if entry.is_expired(now) => {
                st.remove(key);
                st.stats.expirations += 1;
                st.stats.misses += 1;
                None
            }
            Some(entry) => {
                entry.last_accessed_at = now;
                st.stats.hits += 1;
                Some(Arc::clone(&entry.value))
            }
        }
    }

    /// Inspect an entry without refreshing its recency.
    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let now = Instant::now();
        let st = self.state.lock();
        st.entries.peek(key).map(|entry| EntryInfo {
            size: entry.size,
            age: now.saturating_duration_since(entry.created_at),
            idle: now.saturating_duration_since(entry.last_accessed_at),
            ttl_remaining: entry.expires_at.saturating_duration_since(now),
            tags: entry.tags.clone(),
        })
    }

    /// Store `value` under `key` for `ttl` (or the default TTL).
    ///
    /// Rejected, returning `false`, when caching is disabled, the key's query
    /// is a write statement, or the value exceeds `max_entry_size`. Otherwise
    /// least-recently-used entries are evicted until the value fits.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>, tags: &[String]) -> bool {
        if !self.config.enabled {
            return false;
        }
        let size = value.weight();
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.config.default_ttl).min(MAX_TTL);
        let expires_at = now + ttl;
        let mut st = self.state.lock();
        if is_write_statement(query_of(key)) {
            st.stats.rejections += 1;
            debug!(key = %query_of(key), "cache set rejected: write statement");
            return false;
        }
        if size > self.config.max_entry_size || size > self.config.max_size {
            st.stats.rejections += 1;
            debug!(size, max_entry_size = self.config.max_entry_size, "cache set rejected: oversized");
            return false;
        }

        st.remove(key);
        let mut evicted = 0u64;
        while st.size + size > self.config.max_size {
            let Some((victim, entry)) = st.entries.pop_lru() else {
                break;
            };
            st.size -= entry.size;
            st.forget_tags(&victim, &entry.tags);
            evicted += 1;
        }
        if evicted > 0 {
            st.stats.evictions += evicted;
            debug!(evicted, size = st.size, "cache evicted least recently used entries");
        }

        let tags: Vec<String> = tags.to_vec();
        for tag in &tags {
            st.tags.entry(tag.clone()).or_default().insert(key.to_string());
        }
        st.size += size;
        st.entries.insert(
            key.to_string(),
            CacheEntry {
                value: Arc::new(value),
                size,
                created_at: now,
                expires_at,
                last_accessed_at: now,
                tags,
            },
        );
        true
    }

    /// Remove one entry by exact key.
    pub fn invalidate(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Remove every entry carrying `tag`.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut st = self.state.lock();
        let Some(keys) = st.tags.remove(tag) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if st.remove(&key).is_some() {
                removed += 1;
            }
        }
        debug!(tag, removed, "cache invalidated by tag");
        removed
    }

    /// Remove every entry whose key matches the glob `pattern`.
    pub fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let glob = glob::Pattern::new(pattern).map_err(|source| CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        let mut st = self.state.lock();
        let matched: Vec<String> = st
            .entries
            .keys()
            .filter(|key| glob.matches(key))
            .cloned()
            .collect();
        for key in &matched {
            st.remove(key);
        }
        debug!(pattern, removed = matched.len(), "cache invalidated by pattern");
        Ok(matched.len())
    }

    /// Sweep out every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut st = self.state.lock();
        let expired: Vec<String> = st
            .entries
            .keys()
            .filter(|key| st.entries.peek(key).is_some_and(|e| e.is_expired(now)))
            .cloned()
            .collect();
        for key in &expired {
            st.remove(key);
        }
        st.stats.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn clear(&self) {
        let mut st = self.state.lock();
        st.entries.clear();
        st.tags.clear();
        st.size = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.state.lock();
        CacheStats {
            entries: st.entries.len(),
            size_bytes: st.size,
            ..st.stats
        }
    }
}

impl<V: Weigh + Send + Sync> Cacheable<V> for QueryCache<V> {
    fn get(&self, key: &str) -> Option<Arc<V>> {
        QueryCache::get(self, key)
    }

    fn set(&self, key: &str, value: V, ttl: Option<Duration>, tags: &[String]) -> bool {
        QueryCache::set(self, key, value, ttl, tags)
    }

    fn invalidate(&self, key: &str) -> bool {
        QueryCache::invalidate(self, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::derive_key;
    use serde_json::json;

    fn cache(max_size: usize) -> QueryCache<String> {
        QueryCache::new(CacheConfig {
            enabled: true,
            max_size,
            default_ttl: Duration::from_secs(60),
            max_entry_size: max_size,
        })
    }

    fn s(v: &str) -> String {
        v.to_string()
    }

    // ── TTL ────────────────────────────────────────────────────────

    #[test]
    fn oversized_ttl_is_capped() {
        let cache = cache(1024);
        let tags = vec![s("t")];
        assert!(cache.set("k", s("vvvvv"), Some(Duration::MAX), &tags));
        assert!(cache.set("j", s("v"), Some(Duration::from_secs(u64::MAX)), &[]));

        let info = cache.entry_info("k").unwrap();
        assert!(info.ttl_remaining <= MAX_TTL);
        assert!(info.ttl_remaining > MAX_TTL - Duration::from_secs(60));
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.size_bytes, 6);

        assert_eq!(cache.invalidate_by_tag("t"), 1);
        assert_eq!(cache.stats().size_bytes, 1);
    }

    #[test]
    fn entry_expires_after_ttl() {
        let cache = cache(1024);
        assert!(cache.set("k", s("v"), Some(Duration::from_millis(100)), &[]));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get("k").as_deref(), Some(&s("v")));

        std::thread::sleep(Duration::from_millis(100));
        assert!(cache.get("k").is_none());
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn purge_sweeps_expired_entries() {
        let cache = cache(1024);
        cache.set("short", s("1"), Some(Duration::from_millis(10)), &[]);
        cache.set("long", s("2"), None, &[]);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    // ── LRU ────────────────────────────────────────────────────────

    #[test]
    fn least_recently_used_is_evicted_first() {
        let cache = cache(3);
        cache.set("A", s("a"), None, &[]);
        cache.set("B", s("b"), None, &[]);
        cache.set("C", s("c"), None, &[]);
        assert!(cache.get("A").is_some());

        cache.set("D", s("d"), None, &[]);
        assert!(cache.get("B").is_none());
        assert!(cache.get("A").is_some());
        assert!(cache.get("C").is_some());
        assert!(cache.get("D").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn large_value_evicts_several() {
        let cache = cache(10);
        for key in ["a", "b", "c", "d", "e"] {
            cache.set(key, s("xx"), None, &[]);
        }
        assert!(cache.set("big", s("xxxxxx"), None, &[]));
        let stats = cache.stats();
        assert_eq!(stats.size_bytes, 10);
        assert_eq!(stats.evictions, 3);
        assert!(cache.get("a").is_none());
        assert!(cache.get("d").is_some());
    }

    #[test]
    fn overwrite_replaces_size() {
        let cache = cache(100);
        cache.set("k", s("12345"), None, &[]);
        cache.set("k", s("12"), None, &[]);
        assert_eq!(cache.stats().size_bytes, 2);
        assert_eq!(cache.len(), 1);
    }

    // ── Rejections ─────────────────────────────────────────────────

    #[test]
    fn rejects_oversized_values() {
        let cache: QueryCache<String> = QueryCache::new(CacheConfig {
            enabled: true,
            max_size: 100,
            default_ttl: Duration::from_secs(60),
            max_entry_size: 4,
        });
        assert!(!cache.set("k", s("too long"), None, &[]));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().rejections, 1);
    }

    #[test]
    fn rejects_write_statements() {
        let cache = cache(1024);
        let key = derive_key("UPDATE users SET name = $1", &[json!("bob")]);
        assert!(!cache.set(&key, s("ok"), None, &[]));
        let key = derive_key("SELECT name FROM users WHERE id = $1", &[json!("delete me")]);
        assert!(cache.set(&key, s("bob"), None, &[]));
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache: QueryCache<String> = QueryCache::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        assert!(!cache.set("k", s("v"), None, &[]));
        assert!(cache.get("k").is_none());
    }

    // ── Invalidation ───────────────────────────────────────────────

    #[test]
    fn invalidate_by_tag_removes_tagged_entries() {
        let cache = cache(1024);
        cache.set("u1", s("alice"), None, &[s("users")]);
        cache.set("u2", s("bob"), None, &[s("users"), s("admins")]);
        cache.set("o1", s("order"), None, &[s("orders")]);

        assert_eq!(cache.invalidate_by_tag("users"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate_by_tag("admins"), 0);
        assert!(cache.get("o1").is_some());
    }

    #[test]
    fn invalidate_by_pattern_matches_glob() {
        let cache = cache(4096);
        let users = derive_key("SELECT * FROM users WHERE id = $1", &[json!(1)]);
        let orders = derive_key("SELECT * FROM orders", &[]);
        cache.set(&users, s("u"), None, &[]);
        cache.set(&orders, s("o"), None, &[]);

        assert_eq!(cache.invalidate_by_pattern("*FROM users*").unwrap(), 1);
        assert!(cache.get(&users).is_none());
        assert!(cache.get(&orders).is_some());
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let cache = cache(16);
        assert!(matches!(
            cache.invalidate_by_pattern("[unclosed"),
            Err(CacheError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn entry_info_reports_tags_and_ttl() {
        let cache = cache(1024);
        cache.set("k", s("value"), Some(Duration::from_secs(30)), &[s("users")]);
        let info = cache.entry_info("k").unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.tags, vec![s("users")]);
        assert!(info.ttl_remaining <= Duration::from_secs(30));
        assert!(info.ttl_remaining > Duration::from_secs(29));
        assert!(cache.entry_info("missing").is_none());
    }

    #[test]
    fn hit_rate_tracks_lookups() {
        let cache = cache(1024);
        cache.set("k", s("v"), None, &[]);
        cache.get("k");
        cache.get("k");
        cache.get("k");
        cache.get("missing");
        assert!((cache.stats().hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn cacheable_trait_object_round_trip() {
        let cache: Arc<dyn Cacheable<String>> = Arc::new(cache(64));
        assert!(cache.set("k", s("v"), None, &[]));
        assert_eq!(cache.get("k").as_deref(), Some(&s("v")));
        assert!(cache.invalidate("k"));
        assert!(cache.get("k").is_none());
    }
}
