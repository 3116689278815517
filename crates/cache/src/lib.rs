//! GPU Service Transfer Cache
//!
//! Byte-budgeted LRU cache of deserialized transfer cache entries, with
//! discardable-handle backed eviction and memory-pressure driven sizing.

pub mod color_space;
pub mod config;
pub mod discardable;
pub mod entry;
pub mod image;
pub mod memory_coordinator;
pub mod raw_memory;
pub mod store;
pub mod transfer_cache;

pub use color_space::{ColorSpace, ColorSpaceEntry};
pub use config::{ConfigError, TransferCacheConfig};
pub use discardable::{ClientDiscardableHandle, DiscardableHandle, ServiceDiscardableHandle};
pub use entry::{
    create_entry, deserialize_entry, DecodeContext, DeserializeError, TransferCacheEntry,
    TransferCacheEntryType,
};
pub use image::{ColorType, ImageEntry};
pub use memory_coordinator::{
    MemoryCoordinator, MemoryCoordinatorClient, MemoryPressureLevel, MemoryState, Registration,
};
pub use raw_memory::RawMemoryEntry;
pub use transfer_cache::{CacheKey, ServiceTransferCache, TransferCacheStats};
