//! LRU-ordered entry store
//!
//! Thin wrapper over [`lru::LruCache`] without a capacity bound; the transfer
//! cache bounds it by bytes instead. Lookups come in two flavors: [`peek`]
//! leaves the recency order alone, [`get`] promotes the entry to
//! most-recently-used.
//!
//! [`peek`]: LruStore::peek
//! [`get`]: LruStore::get

use std::hash::Hash;

use lru::LruCache;

pub struct LruStore<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
}

impl<K: Hash + Eq + Clone, V> LruStore<K, V> {
    pub fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
        }
    }

    /// Look up without touching recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.peek(key)
    }

    /// Look up and mark most-recently-used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Insert at the most-recently-used end, returning any value replaced
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        self.entries.put(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key)
    }

    /// Keys ordered from least to most recently used
    pub fn keys_lru_first(&self) -> Vec<K> {
        self.entries.iter().rev().map(|(key, _)| key.clone()).collect()
    }

    /// Entries ordered from least to most recently used
    pub fn iter_lru_first(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Hash + Eq + Clone, V> Default for LruStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
