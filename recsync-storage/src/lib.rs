//! recsync Storage - Gateway and Cache Layer
//!
//! Contracts to the remote source and the read-through cache decorator that
//! sits in front of it, plus the durable pending-state surface stores use to
//! survive restarts. Concrete transports and persistence media live outside
//! this crate.

pub mod cache;
pub mod gateway;
pub mod state;

pub use cache::{
    is_read_key, read_key, CacheBackend, CacheConfig, CacheGateway, CacheStats,
    InMemoryCacheBackend, Watermark,
};
pub use gateway::{Gateway, HeadSource, ReadCache, ReadResult, WriteBatch, WriteResponse};
pub use state::{
    DurableState, InMemoryDurableState, SNAPSHOT_CREATE, SNAPSHOT_CREATE_FLAGS, SNAPSHOT_DELETE,
    SNAPSHOT_DELETE_FLAGS, SNAPSHOT_KEYS, SNAPSHOT_UPDATE, SNAPSHOT_UPDATE_FLAGS,
};
