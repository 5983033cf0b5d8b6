//! TTL map with capacity eviction.
//!
//! Expiry is fixed at write time. A read past it removes the entry and counts
//! as a miss. When an insert of a new key finds the map at capacity, expired
//! entries are dropped first and then the oldest 10% by write time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::key::CacheCategory;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "vjob_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "vjob_cache_misses_total";
    pub const CACHE_EVICTIONS_TOTAL: &str = "vjob_cache_evictions_total";
    pub const CACHE_EXPIRED_TOTAL: &str = "vjob_cache_expired_total";
}

struct CacheEntry<V> {
    data: V,
    created_at: Instant,
    expires_at: Instant,
    hit_count: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Entry metadata, readable without touching the hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub created_at: Instant,
    pub expires_at: Instant,
    pub hit_count: u64,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// In-memory cache with per-entry TTL.
///
/// One instance is shared by every job in a process; construct it once and
/// hand out `Arc<TtlCache<V>>`.
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

fn category_label(key: &str) -> &'static str {
    CacheCategory::of_key(key)
        .map(|c| c.as_str())
        .unwrap_or("other")
}

impl<V: Clone> TtlCache<V> {
    /// Create a new cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // A panic while holding the lock leaves the map itself consistent, so
    // poisoning is ignored rather than propagated.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn record_hit(&self, key: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_HITS_TOTAL, "category" => category_label(key)).increment(1);
    }

    fn record_miss(&self, key: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_MISSES_TOTAL, "category" => category_label(key)).increment(1);
    }

    /// Look up a live entry.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.write();

        let lookup = entries.get_mut(key).map(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                entry.hit_count += 1;
                Some(entry.data.clone())
            }
        });

        match lookup {
            Some(Some(data)) => {
                drop(entries);
                self.record_hit(key);
                Some(data)
            }
            Some(None) => {
                entries.remove(key);
                drop(entries);
                counter!(names::CACHE_EXPIRED_TOTAL).increment(1);
                self.record_miss(key);
                None
            }
            None => {
                drop(entries);
                self.record_miss(key);
                None
            }
        }
    }

    /// Insert or replace. `ttl = None` resolves the TTL from the key's category.
    pub fn set(&self, key: impl Into<String>, data: V, ttl: Option<Duration>) {
        let key = key.into();
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for_key(&key));
        let now = Instant::now();

        let mut entries = self.write();
        if !entries.contains_key(&key) && entries.len() >= self.capacity() {
            self.make_room(&mut entries, now);
        }

        entries.insert(
            key,
            CacheEntry {
                data,
                created_at: now,
                expires_at: now + ttl,
                hit_count: 0,
            },
        );
    }

    fn capacity(&self) -> usize {
        self.config.max_entries.max(1)
    }

    fn make_room(&self, entries: &mut HashMap<String, CacheEntry<V>>, now: Instant) {
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        if entries.len() < self.capacity() {
            debug!("Cache made room by dropping {} expired entries", before - entries.len());
            return;
        }

        let to_evict = (self.capacity() / 10).max(1);
        let mut by_age: Vec<(Instant, String)> = entries
            .iter()
            .map(|(key, entry)| (entry.created_at, key.clone()))
            .collect();
        by_age.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, key) in by_age.into_iter().take(to_evict) {
            entries.remove(&key);
        }

        self.evictions.fetch_add(to_evict as u64, Ordering::Relaxed);
        counter!(names::CACHE_EVICTIONS_TOTAL).increment(to_evict as u64);
        debug!(
            evicted = to_evict,
            capacity = self.capacity(),
            "Cache at capacity, evicted oldest entries"
        );
    }

    /// Remove one key.
    pub fn invalidate(&self, key: &str) {
        self.write().remove(key);
    }

    /// Remove every key starting with `prefix`. Returns how many were removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Remove everything. Counters are kept.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            counter!(names::CACHE_EXPIRED_TOTAL).increment(removed as u64);
        }
        removed
    }

    /// Metadata of a live entry.
    pub fn entry_meta(&self, key: &str) -> Option<EntryMeta> {
        let now = Instant::now();
        self.read()
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| EntryMeta {
                created_at: entry.created_at,
                expires_at: entry.expires_at,
                hit_count: entry.hit_count,
            })
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Return the cached value, or run `compute` and cache its success.
    ///
    /// Concurrent misses on the same key each run `compute`; the last
    /// writer wins.
    pub async fn get_or_insert_with<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let value = compute().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }
}

/// Handle to the background sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// Start the periodic expiry sweep on the configured interval.
    pub fn start_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let cache = Arc::clone(self);
        let period = cache.config.sweep_interval;

        let task = tokio::spawn(async move {
            info!("Starting cache sweeper (interval: {:?})", period);
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!(removed, remaining = cache.len(), "Cache sweep");
                        }
                    }
                }
            }

            debug!("Cache sweeper stopped");
        });

        SweeperHandle { shutdown, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn cache(max_entries: usize) -> TtlCache<String> {
        TtlCache::new(CacheConfig::default().with_max_entries(max_entries))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_counts_miss() {
        let cache = cache(100);
        cache.set("transcript:abc", "hi".to_string(), Some(Duration::from_millis(100)));

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(cache.get("transcript:abc"), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 1);
        // logically deleted on access
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcript_scenario() {
        let cache = cache(100);
        cache.set("transcript:abc", "{\"text\":\"hi\"}".to_string(), Some(Duration::from_millis(1000)));

        assert_eq!(cache.get("transcript:abc").as_deref(), Some("{\"text\":\"hi\"}"));
        assert_eq!(cache.entry_meta("transcript:abc").unwrap().hit_count, 1);
        assert_eq!(cache.stats().hits, 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.get("transcript:abc"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_category_ttl_applies_without_explicit_ttl() {
        let cache = cache(100);
        cache.set("quota:u1", "5".to_string(), None);
        let meta = cache.entry_meta("quota:u1").unwrap();
        assert_eq!(meta.expires_at - meta.created_at, Duration::from_secs(30));
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let cache = cache(20);
        for i in 0..100 {
            cache.set(format!("metadata:{i}"), i.to_string(), None);
            assert!(cache.len() <= 20);
        }
        assert!(cache.stats().evictions > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_drops_oldest_by_write_time() {
        let cache = cache(10);
        for i in 0..10 {
            cache.set(format!("metadata:{i}"), i.to_string(), None);
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        // refresh the oldest key so it is no longer the oldest
        cache.set("metadata:0", "fresh".to_string(), None);
        tokio::time::advance(Duration::from_millis(1)).await;

        cache.set("metadata:new", "x".to_string(), None);

        assert_eq!(cache.len(), 10);
        assert!(cache.entry_meta("metadata:1").is_none());
        assert!(cache.entry_meta("metadata:0").is_some());
        assert!(cache.entry_meta("metadata:new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_reclaimed_before_eviction() {
        let cache = cache(5);
        for i in 0..5 {
            cache.set(format!("quota:{i}"), i.to_string(), Some(Duration::from_millis(10)));
        }
        tokio::time::advance(Duration::from_millis(20)).await;

        cache.set("metadata:a", "a".to_string(), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_overwrite_at_capacity_does_not_evict() {
        let cache = cache(3);
        for i in 0..3 {
            cache.set(format!("metadata:{i}"), i.to_string(), None);
        }
        cache.set("metadata:1", "again".to_string(), None);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_prefix_invalidation() {
        let cache = cache(100);
        cache.set("owner-result:u1:abc", "a".to_string(), None);
        cache.set("owner-result:u1:def", "b".to_string(), None);
        cache.set("owner-result:u2:abc", "c".to_string(), None);
        cache.set("transcript:abc", "t".to_string(), None);

        assert_eq!(cache.invalidate_prefix("owner-result:u1:"), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.invalidate_prefix("missing:"), 0);

        cache.invalidate("transcript:abc");
        assert!(cache.get("transcript:abc").is_none());

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_insert_with_memoizes_success_only() {
        let cache = cache(100);
        let calls = AtomicU32::new(0);

        let first: Result<String, String> = cache
            .get_or_insert_with("ai-result:h", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("summary".to_string())
            })
            .await;
        let second: Result<String, String> = cache
            .get_or_insert_with("ai-result:h", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("other".to_string())
            })
            .await;

        assert_eq!(tokio_test::assert_ok!(first), "summary");
        assert_eq!(tokio_test::assert_ok!(second), "summary");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let failed: Result<String, String> = cache
            .get_or_insert_with("ai-result:err", None, || async { Err("boom".to_string()) })
            .await;
        tokio_test::assert_err!(failed);
        assert!(cache.entry_meta("ai-result:err").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_without_reads() {
        let cache = Arc::new(TtlCache::<String>::new(
            CacheConfig::default().with_sweep_interval(Duration::from_millis(50)),
        ));
        cache.set("quota:u1", "1".to_string(), Some(Duration::from_millis(20)));
        cache.set("transcript:abc", "t".to_string(), None);

        let sweeper = cache.start_sweeper();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(cache.len(), 1);
        // sweeping is not a read
        assert_eq!(cache.stats().misses, 0);

        sweeper.shutdown().await;
    }
}
