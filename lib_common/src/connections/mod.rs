//! # Connections Module
//!
//! The shared, thread-safe services that coordinate across live sessions and
//! processes: a JSON cache with per-key expiry and a channel-based pub/sub
//! bus. Each has a Redis backend for production and an in-memory backend for
//! tests and single-node runs.

/// Cache service, backend trait and key namespaces.
pub mod cache_store;
/// In-process cache backend with lazy expiry.
pub mod cache_memory;
/// Redis cache backend.
pub mod cache_redis;

/// Pub/sub service, transport trait and callback registry.
pub mod pubsub_bus;
/// In-process pub/sub transport on tokio broadcast channels.
pub mod pubsub_memory;
/// Redis pub/sub transport.
pub mod pubsub_redis;

pub use cache_memory::MemoryCacheBackend;
pub use cache_redis::RedisCacheBackend;
pub use cache_store::{BackendInfo, CacheBackend, CacheError, CacheHealth, CacheStats, CacheStore, HealthStatus, KeyTtl};
pub use pubsub_bus::{BusError, BusTransport, PubSubBus};
pub use pubsub_memory::MemoryBusTransport;
pub use pubsub_redis::RedisBusTransport;
