//! Service-side transfer cache with LRU eviction
//!
//! Holds deserialized transfer cache entries keyed by `(type, id)`, within a
//! byte budget that follows the process memory state. Entries created on
//! behalf of a client carry a discardable handle; while the client holds that
//! handle locked the entry cannot be evicted, so the cache may temporarily
//! run over budget.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

use crate::config::TransferCacheConfig;
use crate::discardable::DiscardableHandle;
use crate::entry::{create_entry, DecodeContext, TransferCacheEntry, TransferCacheEntryType};
use crate::memory_coordinator::{
    MemoryCoordinator, MemoryCoordinatorClient, MemoryPressureLevel, MemoryState, Registration,
};
use crate::store::LruStore;

/// Identifies a cache entry; ids are scoped by the creating client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
    pub entry_type: TransferCacheEntryType,
    pub entry_id: u32,
}

impl CacheKey {
    pub fn new(entry_type: TransferCacheEntryType, entry_id: u32) -> Self {
        Self {
            entry_type,
            entry_id,
        }
    }
}

/// Statistics about transfer cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferCacheStats {
    /// Number of live entries
    pub entry_count: usize,
    /// Bytes held by live entries
    pub total_size: usize,
    /// Current byte budget
    pub size_limit: usize,
    /// Lookups that found an entry
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Entries removed by budget enforcement
    pub evictions: u64,
    /// Eviction candidates passed over because their handle was locked
    pub skipped_locked: u64,
}

impl TransferCacheStats {
    /// Cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Budget utilization; above 1.0 while locked entries keep the cache over budget
    pub fn utilization(&self) -> f64 {
        if self.size_limit == 0 {
            0.0
        } else {
            self.total_size as f64 / self.size_limit as f64
        }
    }
}

struct CacheEntryInternal {
    /// Present only for entries created on behalf of a client
    handle: Option<Box<dyn DiscardableHandle>>,
    entry: Box<dyn TransferCacheEntry>,
}

/// Byte-budgeted LRU cache of transfer cache entries
///
/// Not thread-safe: every call, memory notifications included, is expected on
/// the thread that processes GPU commands.
///
/// # Example
///
/// ```
/// use transfer_cache::{
///     ClientDiscardableHandle, DecodeContext, RawMemoryEntry, ServiceTransferCache,
///     TransferCacheConfig, TransferCacheEntryType,
/// };
///
/// let mut cache = ServiceTransferCache::new(TransferCacheConfig::default());
/// let client = ClientDiscardableHandle::new();
///
/// let created = cache.create_locked_entry(
///     TransferCacheEntryType::RawMemory,
///     7,
///     Box::new(client.service_handle()),
///     &DecodeContext::default(),
///     &RawMemoryEntry::serialize(b"pixels"),
/// );
/// assert!(created);
///
/// let entry = cache.get_entry(TransferCacheEntryType::RawMemory, 7).unwrap();
/// assert_eq!(entry.cached_size(), 6);
/// ```
pub struct ServiceTransferCache {
    entries: LruStore<CacheKey, CacheEntryInternal>,
    total_size: usize,
    cache_size_limit: usize,
    memory_state: MemoryState,
    config: TransferCacheConfig,
    stats: TransferCacheStats,
    registration: Option<Registration>,
}

impl ServiceTransferCache {
    /// Create a cache sized for the normal memory state
    pub fn new(config: TransferCacheConfig) -> Self {
        let cache_size_limit = config.limit_for_state(MemoryState::Normal);
        Self {
            entries: LruStore::new(),
            total_size: 0,
            cache_size_limit,
            memory_state: MemoryState::Normal,
            config,
            stats: TransferCacheStats::default(),
            registration: None,
        }
    }

    /// Create a cache and register it with `coordinator`
    pub fn with_coordinator(
        config: TransferCacheConfig,
        coordinator: &Rc<MemoryCoordinator>,
    ) -> Rc<RefCell<Self>> {
        let cache = Rc::new(RefCell::new(Self::new(config)));
        Self::register(&cache, coordinator);
        cache
    }

    /// Register a shared cache for memory notifications.
    ///
    /// The registration lives inside the cache and ends when the cache is
    /// dropped. Registering again replaces the previous registration.
    pub fn register(cache: &Rc<RefCell<Self>>, coordinator: &Rc<MemoryCoordinator>) {
        let client: Rc<RefCell<dyn MemoryCoordinatorClient>> = cache.clone();
        let registration = coordinator.register(Rc::downgrade(&client));

        let mut cache = cache.borrow_mut();
        cache.registration = Some(registration);
        cache.on_memory_state_change(coordinator.memory_state());
    }

    /// Create an entry from client data, backed by the client's discardable handle.
    ///
    /// Returns `false` without changing anything if the key is already in use
    /// or the data does not deserialize.
    pub fn create_locked_entry(
        &mut self,
        entry_type: TransferCacheEntryType,
        entry_id: u32,
        handle: Box<dyn DiscardableHandle>,
        context: &DecodeContext,
        data: &[u8],
    ) -> bool {
        let key = CacheKey::new(entry_type, entry_id);
        if self.entries.contains(&key) {
            tracing::debug!(%entry_type, entry_id, "rejecting duplicate transfer cache entry");
            return false;
        }

        let Some(mut entry) = create_entry(entry_type) else {
            tracing::warn!(%entry_type, "no service-side entry for transfer cache type");
            return false;
        };
        if let Err(error) = entry.deserialize(context, data) {
            tracing::warn!(%entry_type, entry_id, %error, "failed to deserialize transfer cache entry");
            return false;
        }

        self.insert(key, Some(handle), entry);
        true
    }

    /// Insert an entry created by the service itself.
    ///
    /// Any entry already stored under the same key is deleted first. `None`
    /// is ignored.
    pub fn create_local_entry(&mut self, entry_id: u32, entry: Option<Box<dyn TransferCacheEntry>>) {
        let Some(entry) = entry else {
            return;
        };

        let entry_type = entry.entry_type();
        self.delete_entry(entry_type, entry_id);
        self.insert(CacheKey::new(entry_type, entry_id), None, entry);
    }

    /// Release the service's lock on a client entry.
    ///
    /// Returns `false` if the entry is missing or has no handle.
    pub fn unlock_entry(&mut self, entry_type: TransferCacheEntryType, entry_id: u32) -> bool {
        let key = CacheKey::new(entry_type, entry_id);
        match self.entries.peek(&key).and_then(|internal| internal.handle.as_ref()) {
            Some(handle) => {
                handle.unlock();
                true
            }
            None => false,
        }
    }

    /// Remove an entry, force-deleting its handle so the client sees it gone
    pub fn delete_entry(&mut self, entry_type: TransferCacheEntryType, entry_id: u32) -> bool {
        let key = CacheKey::new(entry_type, entry_id);
        let Some(internal) = self.entries.remove(&key) else {
            return false;
        };

        if let Some(handle) = &internal.handle {
            handle.force_delete();
        }
        self.total_size -= internal.entry.cached_size();
        self.debug_check_size();
        true
    }

    /// Look up an entry, marking it most-recently-used
    pub fn get_entry(
        &mut self,
        entry_type: TransferCacheEntryType,
        entry_id: u32,
    ) -> Option<&dyn TransferCacheEntry> {
        let key = CacheKey::new(entry_type, entry_id);
        match self.entries.get(&key) {
            Some(internal) => {
                self.stats.hits += 1;
                Some(internal.entry.as_ref())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Look up and downcast an entry, marking it most-recently-used
    pub fn get_entry_as<T: TransferCacheEntry>(
        &mut self,
        entry_type: TransferCacheEntryType,
        entry_id: u32,
    ) -> Option<&T> {
        self.get_entry(entry_type, entry_id)?.downcast_ref::<T>()
    }

    /// Whether an entry exists, without touching recency or statistics
    pub fn contains(&self, entry_type: TransferCacheEntryType, entry_id: u32) -> bool {
        self.entries.contains(&CacheKey::new(entry_type, entry_id))
    }

    /// Keys from least to most recently used
    pub fn keys_lru_first(&self) -> Vec<CacheKey> {
        self.entries.keys_lru_first()
    }

    /// Bytes held by all live entries
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Current byte budget
    pub fn cache_size_limit(&self) -> usize {
        self.cache_size_limit
    }

    pub fn memory_state(&self) -> MemoryState {
        self.memory_state
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn config(&self) -> &TransferCacheConfig {
        &self.config
    }

    /// Decode context matching this cache's configuration
    pub fn decode_context(&self) -> DecodeContext {
        DecodeContext::new(self.config.max_texture_size)
    }

    pub fn stats(&self) -> TransferCacheStats {
        TransferCacheStats {
            entry_count: self.entries.len(),
            total_size: self.total_size,
            size_limit: self.cache_size_limit,
            ..self.stats
        }
    }

    fn insert(
        &mut self,
        key: CacheKey,
        handle: Option<Box<dyn DiscardableHandle>>,
        entry: Box<dyn TransferCacheEntry>,
    ) {
        let size = entry.cached_size();
        self.entries.put(key, CacheEntryInternal { handle, entry });
        self.total_size += size;
        tracing::trace!(?key, size, total_size = self.total_size, "inserted transfer cache entry");

        self.enforce_limits(Some(key));
        self.debug_check_size();
    }

    /// Evict from the least-recently-used end until within budget.
    ///
    /// Entries whose handle refuses deletion are passed over. `protected`, the
    /// entry just inserted, is never evicted.
    fn enforce_limits(&mut self, protected: Option<CacheKey>) {
        if self.total_size <= self.cache_size_limit {
            return;
        }

        for key in self.entries.keys_lru_first() {
            if self.total_size <= self.cache_size_limit {
                break;
            }
            if Some(key) == protected {
                continue;
            }

            let Some(internal) = self.entries.peek(&key) else {
                continue;
            };
            if let Some(handle) = &internal.handle {
                if !handle.delete() {
                    self.stats.skipped_locked += 1;
                    continue;
                }
            }

            if let Some(internal) = self.entries.remove(&key) {
                let size = internal.entry.cached_size();
                self.total_size -= size;
                self.stats.evictions += 1;
                tracing::debug!(?key, size, "evicted transfer cache entry");
            }
        }

        if self.total_size > self.cache_size_limit {
            tracing::debug!(
                total_size = self.total_size,
                limit = self.cache_size_limit,
                "transfer cache over budget; remaining entries are locked"
            );
        }
    }

    fn debug_check_size(&self) {
        debug_assert_eq!(
            self.total_size,
            self.entries
                .iter_lru_first()
                .map(|(_, internal)| internal.entry.cached_size())
                .sum::<usize>(),
            "transfer cache size accounting drifted"
        );
    }
}

impl MemoryCoordinatorClient for ServiceTransferCache {
    /// Resize the budget for `state`. Entries are evicted lazily, on the next
    /// insertion or purge.
    fn on_memory_state_change(&mut self, state: MemoryState) {
        self.memory_state = state;
        self.cache_size_limit = self.config.limit_for_state(state);
        tracing::debug!(?state, limit = self.cache_size_limit, "transfer cache budget updated");
    }

    fn on_purge_memory(&mut self) {
        let before = self.total_size;
        self.cache_size_limit = 0;
        self.enforce_limits(None);
        self.cache_size_limit = self.config.limit_for_state(self.memory_state);
        self.debug_check_size();
        tracing::debug!(
            freed = before - self.total_size,
            remaining = self.total_size,
            "purged transfer cache"
        );
    }

    fn on_memory_pressure(&mut self, level: MemoryPressureLevel) {
        if level == MemoryPressureLevel::Critical {
            self.on_purge_memory();
        }
    }
}

impl std::fmt::Debug for ServiceTransferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTransferCache")
            .field("entries", &self.entries.len())
            .field("total_size", &self.total_size)
            .field("cache_size_limit", &self.cache_size_limit)
            .field("memory_state", &self.memory_state)
            .finish()
    }
}
