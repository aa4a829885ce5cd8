//! Object store adapters (cAdapter)
//!
//! Submodules:
//! - `s3`: S3-compatible adapter built on aws-sdk-s3
//! - `localfs`: a local directory laid out as `<root>/<bucket>/<key>`, for
//!   development mounts and tests
//!
//! Adapters only move bytes. Admission control lives in
//! [`crate::range::RangeReader`], which wraps any [`RangeBackend`].

pub mod localfs;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use localfs::LocalFsBackend;
pub use s3::{S3Config, S3RangeBackend};

#[async_trait]
pub trait RangeBackend: Send + Sync {
    /// Bytes `[start, end]` (inclusive) of `bucket/key`, fully buffered. The
    /// result is shorter than requested only when the object ends first.
    async fn get_range(&self, bucket: &str, key: &str, start: u64, end: u64) -> Result<Bytes>;
}
