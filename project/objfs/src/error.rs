//! Error taxonomy shared by the resolver, the range reader and the VFS.

use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ObjfsError>;

#[derive(Error, Debug)]
pub enum ObjfsError {
    /// No record for the lookup key. A normal outcome, surfaced as ENOENT.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Metadata store connectivity or pool exhaustion; callers may retry.
    #[error("metadata store unavailable: {0}")]
    Transient(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("backend fetch of {bucket}/{key} failed: {reason}")]
    Backend {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("invalid byte range {start}-{end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("inode {0} is not a directory")]
    NotADirectory(u64),

    #[error("inode {0} is a directory")]
    IsADirectory(u64),

    #[error("distributed cache error: {0}")]
    Cache(String),

    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ObjfsError {
    pub fn backend(bucket: &str, key: &str, reason: impl ToString) -> Self {
        Self::Backend {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Errno reported to the kernel for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::Cancelled => libc::EINTR,
            Self::DeadlineExceeded(_) => libc::ETIMEDOUT,
            Self::InvalidRange { .. } => libc::EINVAL,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            _ => libc::EIO,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Backend { .. } | Self::Cache(_) | Self::Io(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<sqlx::Error> for ObjfsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for ObjfsError {
    fn from(err: redis::RedisError) -> Self {
        Self::Cache(err.to_string())
    }
}
