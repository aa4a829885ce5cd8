//! PostgreSQL repository.
//!
//! Expected table (owned by the migration tooling, see `sql/objects.sql`):
//! `objects(date_partition, virtual_path, path_hash, filename, filename_hash,
//! bucket, key, size, etag, last_modified, storage_class, version_id,
//! checksum_md5, checksum_sha256, status, verified_at)` with a unique index on
//! `(date_partition, path_hash)`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{MetaRepository, ObjectRecord, ObjectStatus, filename_of, normalize_virtual_path, path_digest};
use crate::error::{ObjfsError, Result};

const SELECT_COLUMNS: &str = "virtual_path, filename, bucket, key, size, etag, last_modified, \
     storage_class, version_id, checksum_md5, checksum_sha256";

#[derive(Debug, Clone)]
pub struct PgMetaRepository {
    pool: Arc<PgPool>,
}

impl PgMetaRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str, max_connections: u32, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(dsn)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }
}

#[async_trait]
impl MetaRepository for PgMetaRepository {
    async fn resolve_by_path(&self, virtual_path: &str) -> Result<ObjectRecord> {
        let vp = normalize_virtual_path(virtual_path);
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM objects WHERE path_hash = $1 \
             ORDER BY date_partition DESC LIMIT 1"
        );
        sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(path_digest(&vp))
            .fetch_optional(self.pool.as_ref())
            .await?
            .ok_or(ObjfsError::NotFound(vp))
    }

    async fn resolve_in_partition(&self, virtual_path: &str, partition: NaiveDate) -> Result<ObjectRecord> {
        let vp = normalize_virtual_path(virtual_path);
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM objects WHERE path_hash = $1 AND date_partition = $2 LIMIT 1"
        );
        sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(path_digest(&vp))
            .bind(partition)
            .fetch_optional(self.pool.as_ref())
            .await?
            .ok_or(ObjfsError::NotFound(vp))
    }

    async fn upsert(&self, record: &ObjectRecord, partition: NaiveDate, status: ObjectStatus) -> Result<()> {
        let vp = normalize_virtual_path(&record.virtual_path);
        let filename = filename_of(&vp).to_string();
        sqlx::query(
            "INSERT INTO objects \
             (date_partition, virtual_path, path_hash, filename, filename_hash, bucket, key, size, etag, \
              last_modified, storage_class, version_id, checksum_md5, checksum_sha256, status, verified_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW()) \
             ON CONFLICT (date_partition, path_hash) DO UPDATE SET \
             virtual_path = EXCLUDED.virtual_path, filename = EXCLUDED.filename, \
             filename_hash = EXCLUDED.filename_hash, bucket = EXCLUDED.bucket, key = EXCLUDED.key, \
             size = EXCLUDED.size, etag = EXCLUDED.etag, last_modified = EXCLUDED.last_modified, \
             storage_class = EXCLUDED.storage_class, version_id = EXCLUDED.version_id, \
             checksum_md5 = EXCLUDED.checksum_md5, checksum_sha256 = EXCLUDED.checksum_sha256, \
             status = EXCLUDED.status, verified_at = NOW()",
        )
        .bind(partition)
        .bind(&vp)
        .bind(path_digest(&vp))
        .bind(&filename)
        .bind(path_digest(&filename))
        .bind(&record.bucket)
        .bind(&record.key)
        .bind(record.size)
        .bind(&record.etag)
        .bind(record.last_modified)
        .bind(&record.storage_class)
        .bind(&record.version_id)
        .bind(&record.checksum_md5)
        .bind(&record.checksum_sha256)
        .bind(status.as_str())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}
