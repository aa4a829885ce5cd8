//! Three-tier metadata resolution: in-process LRU, distributed cache, repository.
//!
//! Lookups short-circuit on the first hit and fill the tiers above on the way
//! back. The distributed tier is best effort in both directions: a failed or
//! undecodable read is a miss, and a failed write is only a warning. There is
//! no negative caching and no per-key locking; two concurrent misses on the
//! same key each query the repository and write the same snapshot.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{MetaRepository, ObjectRecord, normalize_virtual_path};
use crate::cache::{BoundedCache, DistributedCache};
use crate::error::{ObjfsError, Result};
use crate::metrics::Metrics;
use crate::util::cancellable;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub lru_capacity: usize,
    /// TTL applied to distributed-cache writes.
    pub ttl: Duration,
    /// Namespace prepended to every distributed-cache key.
    pub key_prefix: String,
}

impl ResolverConfig {
    /// Long-lived entries for the filesystem read path.
    pub fn filesystem() -> Self {
        Self {
            lru_capacity: 50_000,
            ttl: Duration::from_secs(30 * 60),
            key_prefix: "resolve".to_string(),
        }
    }

    /// Shorter entries for ingestion-facing lookups, which race with upserts.
    pub fn ingestion() -> Self {
        Self {
            lru_capacity: 10_000,
            ttl: Duration::from_secs(5 * 60),
            key_prefix: "resolve".to_string(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::filesystem()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub local_hits: u64,
    pub remote_hits: u64,
    pub repository_queries: u64,
    pub cache_write_failures: u64,
}

/// What is being resolved: the latest record for a path, or the record of
/// one ingestion date.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LookupKey {
    Latest(String),
    Partition(NaiveDate, String),
}

impl LookupKey {
    fn remote_key(&self, prefix: &str) -> String {
        match self {
            Self::Latest(vp) => format!("{prefix}:path:{vp}"),
            Self::Partition(date, vp) => format!("{prefix}:date:{}:{vp}", date.format("%Y-%m-%d")),
        }
    }
}

pub struct Resolver {
    repo: Arc<dyn MetaRepository>,
    remote: Arc<dyn DistributedCache>,
    local: BoundedCache<LookupKey, ObjectRecord>,
    config: ResolverConfig,
    metrics: Arc<Metrics>,
}

impl Resolver {
    pub fn new(
        repo: Arc<dyn MetaRepository>,
        remote: Arc<dyn DistributedCache>,
        config: ResolverConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            repo,
            remote,
            local: BoundedCache::new(config.lru_capacity),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            local_hits: self.metrics.local_hits.get(),
            remote_hits: self.metrics.remote_hits.get(),
            repository_queries: self.metrics.repository_queries.get(),
            cache_write_failures: self.metrics.cache_write_failures.get(),
        }
    }

    /// Latest record for `key` (any path form; it is normalized first).
    pub async fn resolve(&self, key: &str, cancel: &CancellationToken) -> Result<ObjectRecord> {
        self.resolve_key(LookupKey::Latest(normalize_virtual_path(key)), cancel)
            .await
    }

    /// Record for `key` as ingested on `partition`.
    pub async fn resolve_in_partition(
        &self,
        key: &str,
        partition: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<ObjectRecord> {
        self.resolve_key(
            LookupKey::Partition(partition, normalize_virtual_path(key)),
            cancel,
        )
        .await
    }

    async fn resolve_key(&self, key: LookupKey, cancel: &CancellationToken) -> Result<ObjectRecord> {
        if cancel.is_cancelled() {
            return Err(ObjfsError::Cancelled);
        }

        if let Some(record) = self.local.get(&key) {
            self.metrics.local_hits.inc();
            return Ok(record);
        }

        let remote_key = key.remote_key(&self.config.key_prefix);
        match cancellable(cancel, self.remote.get(&remote_key)).await {
            Ok(Some(raw)) => match serde_json::from_slice::<ObjectRecord>(&raw) {
                Ok(record) => {
                    debug!(key = %remote_key, "distributed cache hit");
                    self.metrics.remote_hits.inc();
                    self.local.set(key, record.clone());
                    return Ok(record);
                }
                Err(e) => debug!(key = %remote_key, error = %e, "undecodable cache entry, treating as miss"),
            },
            Ok(None) => {}
            Err(ObjfsError::Cancelled) => return Err(ObjfsError::Cancelled),
            Err(e) => warn!(key = %remote_key, error = %e, "distributed cache read failed, treating as miss"),
        }

        self.metrics.repository_queries.inc();
        let record = match &key {
            LookupKey::Latest(vp) => cancellable(cancel, self.repo.resolve_by_path(vp)).await?,
            LookupKey::Partition(date, vp) => {
                cancellable(cancel, self.repo.resolve_in_partition(vp, *date)).await?
            }
        };
        self.local.set(key, record.clone());

        if let Err(e) = self.store_remote(&remote_key, &record, cancel).await {
            self.metrics.cache_write_failures.inc();
            warn!(key = %remote_key, error = %e, "distributed cache write failed; resolution still succeeds");
        }
        Ok(record)
    }

    async fn store_remote(&self, remote_key: &str, record: &ObjectRecord, cancel: &CancellationToken) -> Result<()> {
        let encoded = serde_json::to_vec(record)?;
        cancellable(cancel, self.remote.set_ex(remote_key, &encoded, self.config.ttl)).await
    }
}
