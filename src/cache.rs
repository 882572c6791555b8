//! Size-bounded, TTL-bounded LRU cache for file contents.
//!
//! All operations serialize under one mutex. The recency order and the map
//! always agree on membership, and the byte total of the stored entries is
//! tracked as `current_size`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A cached file body. `data` is immutable once inserted; the access
/// fields are refreshed on every hit.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Arc<[u8]>,
    pub content_type: String,
    pub created: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub memory_usage: usize,
}

struct CacheInner {
    map: HashMap<String, CacheEntry>,
    /// Recency order: front is most recently used.
    order: VecDeque<String>,
    current_size: usize,
    hits: u64,
    misses: u64,
}

pub struct LruCache {
    inner: Mutex<CacheInner>,
    max_size_bytes: usize,
    ttl_seconds: i64,
}

impl LruCache {
    /// A TTL of zero or below disables expiry.
    pub fn new(max_size_bytes: usize, ttl_seconds: i64) -> Self {
        tracing::info!(
            max_bytes = max_size_bytes,
            ttl_seconds,
            "content cache initialized"
        );
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                current_size: 0,
                hits: 0,
                misses: 0,
            }),
            max_size_bytes,
            ttl_seconds,
        }
    }

    /// Look up a key. An expired entry is evicted atomically with the miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.map.contains_key(key) {
            inner.misses += 1;
            return None;
        }

        if self.is_expired(inner.map.get(key).unwrap()) {
            Self::remove_locked(&mut inner, key);
            inner.misses += 1;
            return None;
        }

        Self::promote(&mut inner.order, key);
        let entry = inner.map.get_mut(key).unwrap();
        entry.last_accessed = Instant::now();
        entry.access_count += 1;
        let snapshot = entry.clone();
        inner.hits += 1;
        Some(snapshot)
    }

    /// Insert or overwrite. Empty keys and empty bodies are never cached;
    /// a body that can never fit is skipped with a warning.
    pub fn put(&self, key: &str, data: Vec<u8>, content_type: &str) {
        if key.is_empty() || data.is_empty() {
            return;
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.map.get_mut(key) {
            let old_len = entry.data.len();
            let now = Instant::now();
            entry.data = data.into();
            entry.content_type = content_type.to_string();
            entry.created = now;
            entry.last_accessed = now;
            entry.access_count = 1;
            let new_len = entry.data.len();
            inner.current_size = inner.current_size - old_len + new_len;
            Self::promote(&mut inner.order, key);
            return;
        }

        let entry_size = data.len();
        if entry_size > self.max_size_bytes {
            tracing::warn!(
                key,
                bytes = entry_size,
                max_bytes = self.max_size_bytes,
                "body too large to cache"
            );
            return;
        }

        while inner.current_size + entry_size > self.max_size_bytes && !inner.map.is_empty() {
            Self::evict_lru(&mut inner);
        }

        let now = Instant::now();
        inner.order.push_front(key.to_string());
        inner.map.insert(
            key.to_string(),
            CacheEntry {
                data: data.into(),
                content_type: content_type.to_string(),
                created: now,
                last_accessed: now,
                access_count: 1,
            },
        );
        inner.current_size += entry_size;
    }

    /// Drop one key, if present.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        Self::remove_locked(&mut inner, key);
    }

    /// Drop everything, including hit/miss counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.order.clear();
        inner.current_size = 0;
        inner.hits = 0;
        inner.misses = 0;
    }

    /// Sweep out every expired entry.
    pub fn evict_expired(&self) {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, entry)| self.is_expired(entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            Self::remove_locked(&mut inner, &key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.map.len(),
            memory_usage: inner.current_size,
        }
    }

    /// Hits over total lookups; zero when no lookups have happened.
    pub fn hit_ratio(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let total = inner.hits + inner.misses;
        if total > 0 {
            inner.hits as f64 / total as f64
        } else {
            0.0
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        if self.ttl_seconds <= 0 {
            return false;
        }
        entry.created.elapsed() >= Duration::from_secs(self.ttl_seconds as u64)
    }

    fn remove_locked(inner: &mut CacheInner, key: &str) {
        if let Some(entry) = inner.map.remove(key) {
            inner.current_size -= entry.data.len();
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
        }
    }

    fn promote(order: &mut VecDeque<String>, key: &str) {
        if let Some(pos) = order.iter().position(|k| k == key) {
            if pos != 0 {
                let k = order.remove(pos).unwrap();
                order.push_front(k);
            }
        }
    }

    fn evict_lru(inner: &mut CacheInner) {
        let Some(lru_key) = inner.order.pop_back() else {
            return;
        };
        if let Some(entry) = inner.map.remove(&lru_key) {
            inner.current_size -= entry.data.len();
        }
    }
}
