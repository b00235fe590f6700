//! Read-through caching in front of a gateway.
//!
//! # Invalidation
//!
//! Every cached read lives under a key starting with the configured read
//! prefix. Invalidation is coarse: a successful write, or an explicit
//! [`CacheGateway::clear_read_cache`] call from the staleness poller, wipes
//! all of them at once. Keys outside the prefix are never touched, so a
//! backend may be shared with unrelated data.

pub mod gateway;
pub mod key;
pub mod memory;
pub mod traits;
pub mod watermark;

pub use gateway::{CacheConfig, CacheGateway};
pub use key::{is_read_key, read_key};
pub use memory::InMemoryCacheBackend;
pub use traits::{CacheBackend, CacheStats};
pub use watermark::Watermark;
