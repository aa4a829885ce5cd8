//! In-process [`DistributedCache`] with per-entry TTLs (moka) and a broadcast
//! channel standing in for pub/sub.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use tokio::sync::broadcast;

use super::DistributedCache;
use crate::error::Result;

#[derive(Clone)]
struct TtlValue {
    data: Arc<Vec<u8>>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, TtlValue> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &TtlValue, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &TtlValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// A published `(channel, message)` pair.
pub type Published = (String, String);

pub struct InMemoryDistributedCache {
    entries: moka::future::Cache<String, TtlValue>,
    events: broadcast::Sender<Published>,
}

impl Default for InMemoryDistributedCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl InMemoryDistributedCache {
    pub fn new(max_capacity: u64) -> Self {
        let entries = moka::future::Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        let (events, _) = broadcast::channel(1024);
        Self { entries, events }
    }

    /// Receives every message published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.events.subscribe()
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .get(key)
            .await
            .map(|v| v.data.as_ref().clone()))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let value = TtlValue {
            data: Arc::new(value.to_vec()),
            ttl,
        };
        self.entries.insert(key.to_string(), value).await;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // No subscribers is not an error for pub/sub.
        let _ = self.events.send((channel.to_string(), message.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get() {
        let cache = InMemoryDistributedCache::default();
        assert_eq!(cache.get("k").await.unwrap(), None);
        cache.set_ex("k", b"v1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v1".to_vec()));
        cache.set_ex("k", b"v2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = InMemoryDistributedCache::default();
        cache.set_ex("k", b"v", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let cache = InMemoryDistributedCache::default();
        let mut rx = cache.subscribe();
        cache.publish("object_ingested", "/a|b|k").await.unwrap();
        let (channel, msg) = rx.recv().await.unwrap();
        assert_eq!(channel, "object_ingested");
        assert_eq!(msg, "/a|b|k");
    }
}
