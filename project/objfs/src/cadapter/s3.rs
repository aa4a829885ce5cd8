//! S3 adapter: ranged `GetObject` over aws-sdk-s3.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use bytes::Bytes;
use tracing::debug;

use super::RangeBackend;
use crate::error::{ObjfsError, Result};

/// S3 client options.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    /// Custom endpoint (MinIO, RustFS, ...). Enables path-style addressing.
    pub endpoint: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
        }
    }
}

#[derive(Clone)]
pub struct S3RangeBackend {
    client: Client,
}

impl S3RangeBackend {
    /// Credentials come from the standard AWS provider chain.
    pub async fn new(config: &S3Config) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RangeBackend for S3RangeBackend {
    async fn get_range(&self, bucket: &str, key: &str, start: u64, end: u64) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(format!("bytes={start}-{end}"))
            .send()
            .await
            .map_err(|e| ObjfsError::backend(bucket, key, e.into_service_error()))?;

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| ObjfsError::backend(bucket, key, e))?
            .into_bytes();
        debug!(bucket, key, start, end, len = body.len(), "ranged get");
        Ok(body)
    }
}
