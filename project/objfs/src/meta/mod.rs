//! Object metadata: records, path normalization and the repository seam.
//!
//! Submodules:
//! - `postgres`: the production repository (SQLx over PostgreSQL)
//! - `memory`: an in-process repository with the same semantics
//! - `resolver`: the LRU → distributed cache → repository chain
//! - `ingest`: the write contract used by ingestion collaborators

pub mod ingest;
pub mod memory;
pub mod postgres;
pub mod resolver;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

pub use ingest::{IngestRecorder, NewObject};
pub use memory::InMemoryMetaRepository;
pub use postgres::PgMetaRepository;
pub use resolver::{Resolver, ResolverConfig, ResolverStats};

/// Snapshot of one backing object as stored in the metadata index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ObjectRecord {
    pub virtual_path: String,
    pub filename: String,
    pub bucket: String,
    pub key: String,
    pub size: i64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub storage_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_sha256: Option<String>,
}

impl ObjectRecord {
    /// Object size in bytes; negative sizes in the store read as empty.
    pub fn len(&self) -> u64 {
        u64::try_from(self.size).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    Active,
    Pending,
    Deleted,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for ObjectStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "pending" => Ok(Self::Pending),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown object status `{other}`")),
        }
    }
}

/// Durable object-record store.
///
/// Lookups are keyed by [`path_digest`] of the normalized virtual path, never
/// by the raw string. A missing row is [`ObjfsError::NotFound`]; connectivity
/// problems are [`ObjfsError::Transient`] and must never be folded into
/// `NotFound`.
///
/// [`ObjfsError::NotFound`]: crate::error::ObjfsError::NotFound
/// [`ObjfsError::Transient`]: crate::error::ObjfsError::Transient
#[async_trait]
pub trait MetaRepository: Send + Sync {
    /// Record from the most recent date partition.
    async fn resolve_by_path(&self, virtual_path: &str) -> Result<ObjectRecord>;

    /// Record from exactly one date partition.
    async fn resolve_in_partition(&self, virtual_path: &str, partition: NaiveDate) -> Result<ObjectRecord>;

    /// Idempotent insert-or-update keyed by `(partition, path digest)`.
    async fn upsert(&self, record: &ObjectRecord, partition: NaiveDate, status: ObjectStatus) -> Result<()>;
}

/// Canonical absolute form of a virtual path.
///
/// Empty input is `/`; a leading `/` is added when missing; `.` segments,
/// `..` segments and repeated separators are collapsed lexically. `..` above
/// the root stays at the root.
pub fn normalize_virtual_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    out.push_str(&parts.join("/"));
    out
}

/// Joins `name` under `base` and normalizes the result.
pub fn join_virtual_path(base: &str, name: &str) -> String {
    normalize_virtual_path(&format!("{base}/{name}"))
}

/// Last segment of a normalized path; the root's filename is `/`.
pub fn filename_of(normalized: &str) -> &str {
    match normalized.rfind('/') {
        Some(idx) if idx + 1 < normalized.len() => &normalized[idx + 1..],
        _ => "/",
    }
}

/// Fixed-width index key: lowercase hex SHA-256.
pub fn path_digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_virtual_path() {
        assert_eq!(normalize_virtual_path(""), "/");
        assert_eq!(normalize_virtual_path("."), "/");
        assert_eq!(normalize_virtual_path("/"), "/");
        assert_eq!(normalize_virtual_path("a//b/../c"), "/a/c");
        assert_eq!(normalize_virtual_path("20200101/2014/a.pdf"), "/20200101/2014/a.pdf");
        assert_eq!(normalize_virtual_path("/../../x"), "/x");
        assert_eq!(normalize_virtual_path("/a/./b/"), "/a/b");
        assert_eq!(normalize_virtual_path("a/.."), "/");
    }

    #[test]
    fn test_join_virtual_path() {
        assert_eq!(join_virtual_path("/files", "x.txt"), "/files/x.txt");
        assert_eq!(join_virtual_path("/", "x.txt"), "/x.txt");
        assert_eq!(join_virtual_path("", "../x.txt"), "/x.txt");
    }

    #[test]
    fn test_filename_of() {
        assert_eq!(filename_of("/a/b.pdf"), "b.pdf");
        assert_eq!(filename_of("/b.pdf"), "b.pdf");
        assert_eq!(filename_of("/"), "/");
    }

    #[test]
    fn test_path_digest_is_fixed_width() {
        let d = path_digest("/a/c");
        assert_eq!(d.len(), 64);
        assert_eq!(d, path_digest("/a/c"));
        assert_ne!(d, path_digest("/a/d"));
        assert!(!d.contains("/a/c"));
    }

    #[test]
    fn test_record_json_omits_absent_optionals() {
        let rec = ObjectRecord {
            virtual_path: "/a.pdf".into(),
            filename: "a.pdf".into(),
            bucket: "data-2024".into(),
            key: "2024/05/01/ab12/a.pdf".into(),
            size: 3,
            etag: "\"e\"".into(),
            last_modified: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            storage_class: "STANDARD".into(),
            version_id: None,
            checksum_md5: Some("md5".into()),
            checksum_sha256: None,
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"checksum_md5\":\"md5\""));
        assert!(!json.contains("version_id"));
        let back: ObjectRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("active".parse::<ObjectStatus>().unwrap(), ObjectStatus::Active);
        assert!("gone".parse::<ObjectStatus>().is_err());
        assert_eq!(ObjectStatus::Deleted.as_str(), "deleted");
    }
}
