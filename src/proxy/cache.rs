//! TTL response cache for the bare proxy
//!
//! Entries are keyed by a [`CacheKey`] fingerprint derived from the method,
//! URL, the headers listed in [`CACHE_VARY_HEADERS`] and a digest of the
//! body. Expiry is checked lazily on lookup; the sweeper also calls
//! [`CacheStore::purge_expired`] so idle entries do not linger.
//!
//! All operations take the store lock exactly once, so lookup-with-eviction
//! and insert-with-capacity-eviction are atomic with respect to each other.

use crate::proxy::headers::CACHE_VARY_HEADERS;
use crate::proxy::types::{CacheKey, OutboundRequest, ProxyConfig};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

/// Number of entries inspected when computing [`CacheStats`]
const STATS_SAMPLE_SIZE: usize = 100;

/// A stored upstream response
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub stored_at: Instant,
}

/// Point-in-time view of the cache
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub hit_count: u64,
    /// Mean entry age in seconds over the sampled entries
    pub avg_age: f64,
    pub oldest_age: f64,
    pub newest_age: f64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    hits: u64,
}

/// Bounded, TTL-based response cache
pub struct CacheStore {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_entries: usize,
}

impl CacheStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.cache_ttl, config.cache_max_entries)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.get_at(key, Instant::now())
    }

    /// Look up `key` as of `now`, deleting it if it has expired
    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) => now.saturating_duration_since(entry.stored_at) >= self.ttl,
        };

        if expired {
            inner.entries.remove(key);
            debug!(cache_key = %key, "Evicted expired cache entry");
            return None;
        }

        inner.hits += 1;
        inner.entries.get(key).cloned()
    }

    /// Store `entry` under `key`. Non-2xx responses are ignored.
    ///
    /// Returns true when the entry was stored.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) -> bool {
        if !(200..300).contains(&entry.status) {
            return false;
        }

        let mut inner = self.inner.lock();
        inner.entries.insert(key, entry);

        if inner.entries.len() > self.max_entries {
            let evicted = evict_oldest(&mut inner.entries);
            debug!(evicted, "Cache over capacity, evicted oldest entries");
        }
        true
    }

    /// Remove every entry, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        removed
    }

    /// Remove every expired entry as of `now`
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        let ttl = self.ttl;
        inner
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.stored_at) < ttl);
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> CacheStats {
        let inner = self.inner.lock();
        let ages: Vec<f64> = inner
            .entries
            .values()
            .take(STATS_SAMPLE_SIZE)
            .map(|entry| now.saturating_duration_since(entry.stored_at).as_secs_f64())
            .collect();

        let (avg_age, oldest_age, newest_age) = if ages.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = ages.iter().sum();
            let oldest = ages.iter().copied().fold(f64::MIN, f64::max);
            let newest = ages.iter().copied().fold(f64::MAX, f64::min);
            (sum / ages.len() as f64, oldest, newest)
        };

        CacheStats {
            size: inner.entries.len(),
            hit_count: inner.hits,
            avg_age,
            oldest_age,
            newest_age,
        }
    }
}

/// Drop the oldest 10% of entries (at least one) by `stored_at`
fn evict_oldest(entries: &mut HashMap<CacheKey, CacheEntry>) -> usize {
    let to_remove = (entries.len() / 10).max(1);
    let mut by_age: Vec<(Instant, CacheKey)> = entries
        .iter()
        .map(|(key, entry)| (entry.stored_at, key.clone()))
        .collect();
    by_age.sort_by_key(|(stored_at, _)| *stored_at);

    for (_, key) in by_age.into_iter().take(to_remove) {
        entries.remove(&key);
    }
    to_remove
}

/// Only safe, body-less methods are cached
pub fn is_cacheable_method(method: &http::Method) -> bool {
    matches!(*method, http::Method::GET | http::Method::HEAD)
}

/// Whether `request` should be served from and stored into the cache
pub fn should_cache(config: &ProxyConfig, request: &OutboundRequest) -> bool {
    let enabled = request.cache.unwrap_or(config.cache_enabled);
    enabled && is_cacheable_method(&request.method)
}

/// Derive the cache fingerprint for `request`.
///
/// The input is `METHOD|URL`, followed by `|value` for each vary header that
/// is present and `|md5(body)` when a body is present, hashed with SHA-256.
pub fn derive_cache_key(request: &OutboundRequest) -> CacheKey {
    let mut material = format!("{}|{}", request.method, request.url);

    for name in CACHE_VARY_HEADERS {
        if let Some(value) = request.header(name) {
            material.push('|');
            material.push_str(value);
        }
    }

    if let Some(body) = request.body.as_deref().filter(|body| !body.is_empty()) {
        material.push('|');
        material.push_str(&format!("{:x}", md5::compute(body.as_bytes())));
    }

    let digest = hex::encode(Sha256::digest(material.as_bytes()));
    CacheKey::try_new(digest).unwrap_or_else(|_| unreachable!("sha256 hex digest is 64 hex chars"))
}
