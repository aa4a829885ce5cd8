//! In-memory repository with the same keying and partition rules as the
//! PostgreSQL one. Used for local development and tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::{MetaRepository, ObjectRecord, ObjectStatus, filename_of, normalize_virtual_path, path_digest};
use crate::error::{ObjfsError, Result};

#[derive(Debug, Clone)]
struct Row {
    record: ObjectRecord,
    status: ObjectStatus,
    verified_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryMetaRepository {
    // (path digest, partition) -> row; BTreeMap keeps partitions ordered per digest.
    rows: Mutex<BTreeMap<(String, NaiveDate), Row>>,
    resolve_calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryMetaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resolve queries served so far.
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    /// Simulates a lost connection: every call fails with `Transient`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn status_of(&self, virtual_path: &str, partition: NaiveDate) -> Option<ObjectStatus> {
        let digest = path_digest(&normalize_virtual_path(virtual_path));
        self.rows
            .lock()
            .ok()?
            .get(&(digest, partition))
            .map(|row| row.status)
    }

    pub fn verified_at(&self, virtual_path: &str, partition: NaiveDate) -> Option<DateTime<Utc>> {
        let digest = path_digest(&normalize_virtual_path(virtual_path));
        self.rows
            .lock()
            .ok()?
            .get(&(digest, partition))
            .map(|row| row.verified_at)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ObjfsError::Transient("connection refused".to_string()));
        }
        Ok(())
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, NaiveDate), Row>>> {
        self.rows
            .lock()
            .map_err(|_| ObjfsError::Transient("repository lock poisoned".to_string()))
    }
}

#[async_trait]
impl MetaRepository for InMemoryMetaRepository {
    async fn resolve_by_path(&self, virtual_path: &str) -> Result<ObjectRecord> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let vp = normalize_virtual_path(virtual_path);
        let digest = path_digest(&vp);
        let rows = self.rows()?;
        let lo = (digest.clone(), NaiveDate::MIN);
        let hi = (digest, NaiveDate::MAX);
        rows.range(lo..=hi)
            .next_back()
            .map(|(_, row)| row.record.clone())
            .ok_or(ObjfsError::NotFound(vp))
    }

    async fn resolve_in_partition(&self, virtual_path: &str, partition: NaiveDate) -> Result<ObjectRecord> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let vp = normalize_virtual_path(virtual_path);
        let rows = self.rows()?;
        rows.get(&(path_digest(&vp), partition))
            .map(|row| row.record.clone())
            .ok_or(ObjfsError::NotFound(vp))
    }

    async fn upsert(&self, record: &ObjectRecord, partition: NaiveDate, status: ObjectStatus) -> Result<()> {
        self.check_available()?;
        let vp = normalize_virtual_path(&record.virtual_path);
        let mut stored = record.clone();
        stored.filename = filename_of(&vp).to_string();
        stored.virtual_path = vp;
        let row = Row {
            record: stored,
            status,
            verified_at: Utc::now(),
        };
        self.rows()?.insert((path_digest(&row.record.virtual_path), partition), row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, size: i64) -> ObjectRecord {
        ObjectRecord {
            virtual_path: path.to_string(),
            filename: String::new(),
            bucket: "data-2024".into(),
            key: format!("k{size}"),
            size,
            etag: format!("e{size}"),
            last_modified: Utc::now(),
            storage_class: "STANDARD".into(),
            version_id: None,
            checksum_md5: None,
            checksum_sha256: None,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[tokio::test]
    async fn test_most_recent_partition_wins() {
        let repo = InMemoryMetaRepository::new();
        repo.upsert(&record("a.pdf", 1), day(1), ObjectStatus::Active).await.unwrap();
        repo.upsert(&record("/a.pdf", 2), day(3), ObjectStatus::Active).await.unwrap();
        repo.upsert(&record("/b.pdf", 9), day(9), ObjectStatus::Active).await.unwrap();

        let got = repo.resolve_by_path("/a.pdf").await.unwrap();
        assert_eq!(got.size, 2);
        assert_eq!(got.filename, "a.pdf");

        let older = repo.resolve_in_partition("a.pdf", day(1)).await.unwrap();
        assert_eq!(older.size, 1);
        assert!(repo.resolve_in_partition("a.pdf", day(2)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let repo = InMemoryMetaRepository::new();
        repo.upsert(&record("/a.pdf", 1), day(1), ObjectStatus::Pending).await.unwrap();
        let first = repo.verified_at("/a.pdf", day(1)).unwrap();
        repo.upsert(&record("/a.pdf", 5), day(1), ObjectStatus::Active).await.unwrap();
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.status_of("/a.pdf", day(1)), Some(ObjectStatus::Active));
        assert!(repo.verified_at("/a.pdf", day(1)).unwrap() >= first);
        assert_eq!(repo.resolve_by_path("/a.pdf").await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_unavailable_is_transient_not_not_found() {
        let repo = InMemoryMetaRepository::new();
        repo.set_unavailable(true);
        let err = repo.resolve_by_path("/missing").await.unwrap_err();
        assert!(matches!(err, ObjfsError::Transient(_)));
        repo.set_unavailable(false);
        assert!(repo.resolve_by_path("/missing").await.unwrap_err().is_not_found());
        assert_eq!(repo.resolve_calls(), 2);
    }
}
