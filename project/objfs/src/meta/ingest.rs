//! Write side of the metadata contract, as used by ingestion collaborators.
//!
//! Ingestion upserts a row and announces it on a pub/sub channel. It never
//! touches resolver cache entries: readers pick changes up when their entries
//! expire.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

use super::{MetaRepository, ObjectRecord, ObjectStatus, filename_of, normalize_virtual_path};
use crate::cache::DistributedCache;
use crate::error::Result;

pub const INGEST_CHANNEL: &str = "object_ingested";

/// An object that has landed in the backing store. Checksums are taken as
/// given; they are not recomputed here.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub virtual_path: String,
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub storage_class: Option<String>,
    pub version_id: Option<String>,
    pub checksum_md5: Option<String>,
    pub checksum_sha256: Option<String>,
}

impl NewObject {
    fn into_record(self) -> ObjectRecord {
        let virtual_path = normalize_virtual_path(&self.virtual_path);
        let filename = filename_of(&virtual_path).to_string();
        ObjectRecord {
            virtual_path,
            filename,
            bucket: self.bucket,
            key: self.key,
            size: i64::try_from(self.size).unwrap_or(i64::MAX),
            etag: self.etag,
            last_modified: self.last_modified,
            storage_class: self.storage_class.unwrap_or_else(|| "STANDARD".to_string()),
            version_id: self.version_id,
            checksum_md5: self.checksum_md5,
            checksum_sha256: self.checksum_sha256,
        }
    }
}

pub struct IngestRecorder {
    repo: Arc<dyn MetaRepository>,
    events: Arc<dyn DistributedCache>,
}

impl IngestRecorder {
    pub fn new(repo: Arc<dyn MetaRepository>, events: Arc<dyn DistributedCache>) -> Self {
        Self { repo, events }
    }

    /// Upserts the object under `partition` and publishes
    /// `"<virtual_path>|<bucket>|<key>"` on [`INGEST_CHANNEL`]. A failed
    /// publish is logged; the upsert still counts.
    pub async fn record(&self, object: NewObject, partition: NaiveDate, status: ObjectStatus) -> Result<ObjectRecord> {
        let record = object.into_record();
        self.repo.upsert(&record, partition, status).await?;
        info!(
            path = %record.virtual_path,
            bucket = %record.bucket,
            key = %record.key,
            %partition,
            "object recorded"
        );

        let message = format!("{}|{}|{}", record.virtual_path, record.bucket, record.key);
        if let Err(e) = self.events.publish(INGEST_CHANNEL, &message).await {
            warn!(error = %e, path = %record.virtual_path, "ingest notification failed");
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryDistributedCache;
    use crate::meta::InMemoryMetaRepository;

    fn new_object(path: &str) -> NewObject {
        NewObject {
            virtual_path: path.to_string(),
            bucket: "data-2024".into(),
            key: "2024/05/01/ab12/report.pdf".into(),
            size: 1024,
            etag: "\"abc\"".into(),
            last_modified: Utc::now(),
            storage_class: None,
            version_id: None,
            checksum_md5: Some("d41d8cd98f00b204e9800998ecf8427e".into()),
            checksum_sha256: None,
        }
    }

    #[tokio::test]
    async fn test_record_upserts_and_publishes() {
        let repo = Arc::new(InMemoryMetaRepository::new());
        let events = Arc::new(InMemoryDistributedCache::default());
        let mut rx = events.subscribe();
        let recorder = IngestRecorder::new(repo.clone(), events.clone());
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        let rec = recorder
            .record(new_object("reports//./report.pdf"), date, ObjectStatus::Active)
            .await
            .unwrap();
        assert_eq!(rec.virtual_path, "/reports/report.pdf");
        assert_eq!(rec.filename, "report.pdf");
        assert_eq!(rec.storage_class, "STANDARD");

        let stored = repo.resolve_by_path("/reports/report.pdf").await.unwrap();
        assert_eq!(stored, rec);

        let (channel, msg) = rx.recv().await.unwrap();
        assert_eq!(channel, INGEST_CHANNEL);
        assert_eq!(msg, "/reports/report.pdf|data-2024|2024/05/01/ab12/report.pdf");
    }

    #[tokio::test]
    async fn test_record_surfaces_repository_failure() {
        let repo = Arc::new(InMemoryMetaRepository::new());
        repo.set_unavailable(true);
        let recorder = IngestRecorder::new(repo, Arc::new(InMemoryDistributedCache::default()));
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let err = recorder
            .record(new_object("/a.pdf"), date, ObjectStatus::Active)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
