//! Bounded LRU cache with TTL expiry
//!
//! Fixed-capacity key/value store. Recency lives in an intrusive doubly
//! linked list threaded through a slab of nodes, with a hash index from
//! key to slot, so touch and evict are O(1) regardless of capacity.
//! Entries older than the TTL are treated as absent and removed the
//! moment they are observed; at capacity the least-recently-touched entry
//! is evicted before an insert.
//!
//! All state is confined to the cache itself — no I/O, no timers.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Sentinel slot index for list ends.
const NIL: usize = usize::MAX;

/// Configuration for cache behavior
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries. Eviction precedes insert at capacity.
    pub max_size: usize,
    /// Time-to-live measured from entry creation (refreshed by `set`).
    pub ttl: Duration,
    /// Whether to maintain the cumulative counters.
    pub track_metrics: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            ttl: Duration::from_secs(3600),
            track_metrics: true,
        }
    }
}

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    created_at: Instant,
    last_access: Instant,
    hit_count: u64,
    prev: usize,
    next: usize,
}

/// Snapshot of cache counters and occupancy.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub total_gets: u64,
    pub total_sets: u64,
    /// hits / (hits + misses), in [0, 1].
    pub hit_rate: f64,
    pub size: usize,
    pub max_size: usize,
    /// size / max_size, in [0, 1].
    pub utilization: f64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    total_gets: u64,
    total_sets: u64,
}

/// Bounded LRU cache with time-based expiry.
///
/// # Example
/// ```
/// use foreman::cache::{CacheConfig, LruCache};
///
/// let mut cache: LruCache<String, u32> = LruCache::new(CacheConfig::default());
/// cache.set("answer".to_string(), 42);
/// assert_eq!(cache.get(&"answer".to_string()), Some(&42));
/// ```
#[derive(Debug)]
pub struct LruCache<K, V> {
    max_size: usize,
    ttl: Duration,
    track_metrics: bool,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    /// Most recently touched.
    head: usize,
    /// Least recently touched; eviction victim.
    tail: usize,
    counters: Counters,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Create a new cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        // A capacity of zero cannot hold the entry being inserted.
        let max_size = config.max_size.max(1);
        Self {
            max_size,
            ttl: config.ttl,
            track_metrics: config.track_metrics,
            nodes: Vec::with_capacity(max_size),
            free: Vec::new(),
            index: HashMap::with_capacity(max_size),
            head: NIL,
            tail: NIL,
            counters: Counters::default(),
        }
    }

    /// Create a cache with default configuration.
    pub fn new_default() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Look up a value. An entry past its TTL is removed and counted as an
    /// expiration plus a miss. A hit refreshes recency and the entry's
    /// hit count.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.track_metrics {
            self.counters.total_gets += 1;
        }

        let idx = match self.index.get(key) {
            Some(&idx) => idx,
            None => {
                if self.track_metrics {
                    self.counters.misses += 1;
                }
                return None;
            }
        };

        if self.is_expired(idx) {
            self.remove_slot(idx);
            if self.track_metrics {
                self.counters.expirations += 1;
                self.counters.misses += 1;
            }
            return None;
        }

        self.touch(idx);
        let node = self.nodes[idx].as_mut().expect("indexed slot occupied");
        node.hit_count += 1;
        node.last_access = Instant::now();
        if self.track_metrics {
            self.counters.hits += 1;
        }
        self.nodes[idx].as_ref().map(|n| &n.value)
    }

    /// Insert or update a value. Updating refreshes the TTL clock and
    /// recency. At capacity, the least-recently-touched entry is evicted
    /// first so the size bound always holds.
    pub fn set(&mut self, key: K, value: V) {
        if self.track_metrics {
            self.counters.total_sets += 1;
        }

        if let Some(&idx) = self.index.get(&key) {
            let now = Instant::now();
            let node = self.nodes[idx].as_mut().expect("indexed slot occupied");
            node.value = value;
            node.created_at = now;
            node.last_access = now;
            self.touch(idx);
            return;
        }

        if self.index.len() >= self.max_size {
            self.evict_lru();
        }

        let now = Instant::now();
        let node = Node {
            key: key.clone(),
            value,
            created_at: now,
            last_access: now,
            hit_count: 0,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.attach_front(idx);
    }

    /// Whether a live (non-expired) entry exists. Does not refresh
    /// recency; an expired entry is removed on the spot.
    pub fn has(&mut self, key: &K) -> bool {
        let idx = match self.index.get(key) {
            Some(&idx) => idx,
            None => return false,
        };
        if self.is_expired(idx) {
            self.remove_slot(idx);
            if self.track_metrics {
                self.counters.expirations += 1;
            }
            return false;
        }
        true
    }

    /// Remove an entry. Returns whether it existed.
    pub fn delete(&mut self, key: &K) -> bool {
        match self.index.get(key) {
            Some(&idx) => {
                self.remove_slot(idx);
                true
            }
            None => false,
        }
    }

    /// Drop every entry. Cumulative totals survive; the outcome counters
    /// reset, mirroring a fresh observation window.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
        if self.track_metrics {
            self.counters.hits = 0;
            self.counters.misses = 0;
            self.counters.evictions = 0;
            self.counters.expirations = 0;
        }
    }

    /// Sweep out every expired entry; returns how many were removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let expired: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&idx| self.is_expired(idx))
            .collect();
        let removed = expired.len();
        for idx in expired {
            self.remove_slot(idx);
        }
        if self.track_metrics {
            self.counters.expirations += removed as u64;
        }
        removed
    }

    /// Bulk preload. Returns the number of entries inserted.
    pub fn warm_up<I: IntoIterator<Item = (K, V)>>(&mut self, items: I) -> usize {
        let mut count = 0;
        for (key, value) in items {
            self.set(key, value);
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Keys currently present, most recently touched first.
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut idx = self.head;
        while idx != NIL {
            let node = self.nodes[idx].as_ref().expect("linked slot occupied");
            keys.push(node.key.clone());
            idx = node.next;
        }
        keys
    }

    /// The `n` hottest entries: key, hit count, and time since last
    /// access, sorted by hit count descending.
    pub fn most_accessed(&self, n: usize) -> Vec<(K, u64, Duration)> {
        let mut entries: Vec<(K, u64, Duration)> = self
            .index
            .values()
            .map(|&idx| {
                let node = self.nodes[idx].as_ref().expect("indexed slot occupied");
                (node.key.clone(), node.hit_count, node.last_access.elapsed())
            })
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(n);
        entries
    }

    /// Counter snapshot with derived rates.
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let lookups = c.hits + c.misses;
        CacheStats {
            hits: c.hits,
            misses: c.misses,
            evictions: c.evictions,
            expirations: c.expirations,
            total_gets: c.total_gets,
            total_sets: c.total_sets,
            hit_rate: if lookups > 0 {
                c.hits as f64 / lookups as f64
            } else {
                0.0
            },
            size: self.index.len(),
            max_size: self.max_size,
            utilization: self.index.len() as f64 / self.max_size as f64,
        }
    }

    fn is_expired(&self, idx: usize) -> bool {
        let node = self.nodes[idx].as_ref().expect("indexed slot occupied");
        node.created_at.elapsed() > self.ttl
    }

    fn evict_lru(&mut self) {
        if self.tail == NIL {
            return;
        }
        self.remove_slot(self.tail);
        if self.track_metrics {
            self.counters.evictions += 1;
        }
    }

    fn remove_slot(&mut self, idx: usize) {
        self.detach(idx);
        let node = self.nodes[idx].take().expect("removed slot occupied");
        self.index.remove(&node.key);
        self.free.push(idx);
    }

    fn touch(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.detach(idx);
        self.attach_front(idx);
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().expect("linked slot occupied");
            (node.prev, node.next)
        };
        match prev {
            NIL => self.head = next,
            p => self.nodes[p].as_mut().expect("linked slot occupied").next = next,
        }
        match next {
            NIL => self.tail = prev,
            n => self.nodes[n].as_mut().expect("linked slot occupied").prev = prev,
        }
        let node = self.nodes[idx].as_mut().expect("linked slot occupied");
        node.prev = NIL;
        node.next = NIL;
    }

    fn attach_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.nodes[idx].as_mut().expect("linked slot occupied");
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.nodes[old_head]
                .as_mut()
                .expect("linked slot occupied")
                .prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(max_size: usize) -> LruCache<String, u32> {
        LruCache::new(CacheConfig {
            max_size,
            ttl: Duration::from_secs(60),
            track_metrics: true,
        })
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let mut cache = small_cache(3);
        for i in 0..10 {
            cache.set(format!("k{}", i), i);
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.stats().evictions, 7);
    }

    #[test]
    fn test_evicts_least_recently_touched() {
        let mut cache = small_cache(3);
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);
        cache.set("c".into(), 3);

        // Touch "a" so "b" becomes the LRU entry.
        assert_eq!(cache.get(&"a".into()), Some(&1));

        cache.set("d".into(), 4);
        assert!(!cache.has(&"b".into()));
        assert!(cache.has(&"a".into()));
        assert!(cache.has(&"c".into()));
        assert!(cache.has(&"d".into()));
    }

    #[test]
    fn test_set_refreshes_recency() {
        let mut cache = small_cache(2);
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);
        cache.set("a".into(), 10); // "b" is now LRU
        cache.set("c".into(), 3);
        assert!(!cache.has(&"b".into()));
        assert_eq!(cache.get(&"a".into()), Some(&10));
    }

    #[test]
    fn test_ttl_expiry_counts_expiration_and_miss() {
        let mut cache: LruCache<String, u32> = LruCache::new(CacheConfig {
            max_size: 10,
            ttl: Duration::from_millis(10),
            track_metrics: true,
        });
        cache.set("k".into(), 1);
        std::thread::sleep(Duration::from_millis(25));

        assert_eq!(cache.get(&"k".into()), None);
        assert_eq!(cache.len(), 0, "expired entry must be removed");
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_has_does_not_touch_recency() {
        let mut cache = small_cache(2);
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);

        // `has` must not rescue "a" from eviction.
        assert!(cache.has(&"a".into()));
        cache.set("c".into(), 3);
        assert!(!cache.has(&"a".into()));
    }

    #[test]
    fn test_cleanup_expired() {
        let mut cache: LruCache<String, u32> = LruCache::new(CacheConfig {
            max_size: 10,
            ttl: Duration::from_millis(10),
            track_metrics: true,
        });
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);
        std::thread::sleep(Duration::from_millis(25));
        cache.set("c".into(), 3);

        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.has(&"c".into()));
        assert_eq!(cache.stats().expirations, 2);
    }

    #[test]
    fn test_delete_and_clear() {
        let mut cache = small_cache(4);
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);
        assert!(cache.delete(&"a".into()));
        assert!(!cache.delete(&"a".into()));
        assert_eq!(cache.len(), 1);

        cache.get(&"b".into());
        cache.clear();
        assert!(cache.is_empty());
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        // Totals survive a clear.
        assert_eq!(stats.total_sets, 2);
    }

    #[test]
    fn test_hit_rate() {
        let mut cache = small_cache(4);
        cache.set("a".into(), 1);
        cache.get(&"a".into());
        cache.get(&"a".into());
        cache.get(&"missing".into());
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_keys_in_recency_order() {
        let mut cache = small_cache(4);
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);
        cache.set("c".into(), 3);
        cache.get(&"a".into());
        assert_eq!(cache.keys(), vec!["a".to_string(), "c".into(), "b".into()]);
    }

    #[test]
    fn test_most_accessed() {
        let mut cache = small_cache(4);
        cache.set("hot".into(), 1);
        cache.set("cold".into(), 2);
        cache.get(&"hot".into());
        cache.get(&"hot".into());

        let hottest = cache.most_accessed(1);
        assert_eq!(hottest.len(), 1);
        assert_eq!(hottest[0].0, "hot");
        assert_eq!(hottest[0].1, 2);
    }

    #[test]
    fn test_warm_up() {
        let mut cache = small_cache(10);
        let count = cache.warm_up((0..5).map(|i| (format!("k{}", i), i)));
        assert_eq!(count, 5);
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn test_slot_reuse_after_eviction() {
        // Exercise the free list: evict and insert repeatedly.
        let mut cache = small_cache(2);
        for i in 0..100 {
            cache.set(format!("k{}", i), i);
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"k99".into()), Some(&99));
        assert_eq!(cache.get(&"k98".into()), Some(&98));
    }

    #[test]
    fn test_metrics_disabled() {
        let mut cache: LruCache<String, u32> = LruCache::new(CacheConfig {
            max_size: 2,
            ttl: Duration::from_secs(60),
            track_metrics: false,
        });
        cache.set("a".into(), 1);
        cache.get(&"a".into());
        cache.get(&"nope".into());
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.total_gets, 0);
    }
}
