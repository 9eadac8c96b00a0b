//! Aura Storage - Cache, Persistence and Offline Queue
//!
//! The storage layer under the domain stores:
//!
//! - [`cache::CacheManager`]: TTL cache with a size bound and single-flight loads
//! - [`persistence`]: durable key-value backends (memory, JSON files, LMDB)
//! - [`queue::OfflineQueue`]: bounded retry of failed remote writes
//! - [`scheduler::PersistScheduler`]: debounced or throttled persistence writes

pub mod cache;
pub mod persistence;
pub mod queue;
pub mod scheduler;

pub use cache::{CacheEntry, CacheManager, CacheStats, EntryInfo, Pattern};
pub use persistence::{
    open_persistence, FileKvStore, KeyValuePersistence, LmdbKvStore, LmdbStoreError,
    MemoryKvStore, SharedPersistence, StoreHealth, StoreMetadata, StoreStatus,
};
pub use queue::{
    DrainReport, EnqueueOutcome, FailureRecord, OfflineQueue, OfflineQueueItem, QueueEvent,
    QueueSnapshot,
};
pub use scheduler::{PersistMode, PersistScheduler};
