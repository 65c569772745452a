use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// A value saved in the [`CacheStore`].
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    /// When this entry stops being served.
    pub expires_at: Instant,
    /// Monotonic insertion sequence, used as the eviction order.
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A TTL-bounded, size-bounded key/value store.
///
/// When the store is at capacity, inserting a new key evicts the single oldest entry by
/// insertion order. Entries are not reordered by access.
#[derive(Debug)]
pub struct CacheStore<K, V> {
    capacity: usize,
    entries: HashMap<K, CacheEntry<V>>,
    /// Insertion sequence to key, oldest first.
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K, V> CacheStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Returns the value for `key` unless it is missing or expired.
    ///
    /// Expired entries are removed as a side effect.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            self.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Inserts `value` for `key`, expiring `ttl` from now.
    ///
    /// Replacing an existing key never evicts another entry, but moves the key to the back of
    /// the eviction order.
    pub fn put(&mut self, key: K, value: V, ttl: Duration) {
        if self.capacity == 0 {
            return;
        }

        if let Some(previous) = self.entries.remove(&key) {
            self.order.remove(&previous.seq);
        } else if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.order.insert(seq, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
                seq,
            },
        );
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// The number of stored entries, including expired ones that were not read yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            self.entries.remove(&key);
            tracing::trace!("Evicted oldest cache entry");
            metric!(counter("cache.evicted") += 1);
        }
    }
}
