//! Metadata caches
//!
//! - `lru`: the bounded in-process tier used by the resolver.
//! - `redis`: the distributed tier, shared by every mount and the ingestion side.
//! - `memory`: an in-process stand-in for the distributed tier (development, tests).
//!
//! The distributed tier is reached through [`DistributedCache`] so the resolver
//! never depends on a concrete client.

pub mod lru;
pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use self::lru::BoundedCache;
pub use self::memory::InMemoryDistributedCache;
pub use self::redis::RedisCache;

/// Network key-value store with TTL writes and pub/sub notifications.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// `Ok(None)` on a plain miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
}
