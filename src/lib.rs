//! rowcache - Tiered row cache for relational stores
//!
//! This library puts a cache-aside layer in front of a relational record store:
//! - Local tier: in-process Moka cache (fastest)
//! - Remote tier: Redis, shared across instances
//! - Record store: pluggable table access behind [`RecordStore`]
//!
//! The cache supports:
//! - Read-through `take` with per-key load coalescing
//! - Negative caching of rows that do not exist
//! - Lookups by unique secondary keys that stay consistent with the primary key
//! - Redis pub/sub for local tier invalidation across instances
//! - Configurable TTLs and capacity

mod config;
mod error;
mod inflight;
pub mod keys;
mod model;
pub mod pubsub;
mod record;
mod redis_tier;
mod registry;
mod store;
mod tier;

#[cfg(test)]
mod test_support;

pub use config::{CacheConfig, DEFAULT_INVALIDATION_CHANNEL, ModelConfig, RegistryConfig};
pub use error::{CacheError, Result};
pub use keys::{KeyOption, KeySet, KeySpec};
pub use model::CachedModel;
pub use pubsub::{InvalidationListener, InvalidationMessage, InvalidationPublisher, RedisPublisher};
pub use record::{Conditions, ExecResult, LIMIT_KEY, RecordStore, Row, single_row};
pub use redis_tier::RedisTier;
pub use registry::{CacheRegistry, CacheRegistryBuilder};
pub use store::{Cached, Cacheable, NOT_FOUND_PLACEHOLDER, TieredStore};
pub use tier::{LocalTier, TierBackend};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
