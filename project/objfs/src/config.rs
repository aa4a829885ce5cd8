//! Validated runtime settings built from [`Args`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::cadapter::S3Config;
use crate::cli::Args;
use crate::meta::ResolverConfig;
use crate::range::RangeLayout;

/// Every problem found in one validation pass.
#[derive(Error, Debug)]
#[error("invalid configuration:\n  {}", .0.join("\n  "))]
pub struct ConfigError(pub Vec<String>);

#[derive(Clone, Debug)]
pub struct Config {
    pub postgres_dsn: String,
    pub db_max_connections: u32,
    pub redis_url: String,
    pub s3: S3Config,
    pub local_object_root: Option<PathBuf>,
    pub layout: RangeLayout,
    pub global_s3_limit: usize,
    pub per_bucket_s3_limit: usize,
    pub timeout: Duration,
    pub resolver: ResolverConfig,
    pub mount_point: PathBuf,
    /// `None` when the metrics endpoint is disabled.
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();

        if args.postgres_dsn.trim().is_empty() {
            problems.push("POSTGRES_DSN is not set".to_string());
        }
        if args.db_max_connections == 0 {
            problems.push("DB_MAX_CONNECTIONS must be at least 1".to_string());
        }
        let redis_scheme_ok = ["redis://", "rediss://", "unix://", "redis+unix://"]
            .iter()
            .any(|scheme| args.redis_url.starts_with(scheme));
        if !redis_scheme_ok {
            problems.push(format!(
                "REDIS_URL `{}` is not a redis:// or rediss:// URL",
                args.redis_url
            ));
        }
        if args.s3_region.trim().is_empty() {
            problems.push("S3_REGION must not be empty".to_string());
        }
        if let Some(root) = args.local_object_root.as_ref().filter(|r| !r.is_dir()) {
            problems.push(format!(
                "LOCAL_OBJECT_ROOT `{}` is not a directory",
                root.display()
            ));
        }
        if args.block_size_bytes == 0 {
            problems.push("BLOCK_SIZE_BYTES must be positive".to_string());
        }
        if args.global_s3_limit == 0 {
            problems.push("GLOBAL_S3_LIMIT must be at least 1".to_string());
        }
        if args.per_bucket_s3_limit == 0 {
            problems.push("PER_BUCKET_S3_LIMIT must be at least 1".to_string());
        }
        if args.timeout_secs == 0 {
            problems.push("TIMEOUT_SECS must be positive".to_string());
        }
        if args.lru_capacity == 0 {
            problems.push("LRU_CAPACITY must be at least 1".to_string());
        }
        if args.resolve_ttl_secs == 0 {
            problems.push("RESOLVE_TTL_SECS must be positive".to_string());
        }
        let metrics_addr = match parse_listen_addr(&args.metrics_addr) {
            Ok(addr) => addr,
            Err(e) => {
                problems.push(format!(
                    "METRICS_ADDR `{}` is not a listen address: {e}",
                    args.metrics_addr
                ));
                None
            }
        };
        if !problems.is_empty() {
            return Err(ConfigError(problems));
        }

        let mut prefetch = args.prefetch_size_bytes;
        if prefetch < args.block_size_bytes {
            warn!(
                prefetch,
                block = args.block_size_bytes,
                "PREFETCH_SIZE_BYTES is below BLOCK_SIZE_BYTES; using the block size"
            );
            prefetch = args.block_size_bytes;
        }
        if args.per_bucket_s3_limit > args.global_s3_limit {
            warn!(
                per_bucket = args.per_bucket_s3_limit,
                global = args.global_s3_limit,
                "PER_BUCKET_S3_LIMIT exceeds GLOBAL_S3_LIMIT; the global limit wins"
            );
        }

        Ok(Self {
            postgres_dsn: args.postgres_dsn.clone(),
            db_max_connections: args.db_max_connections,
            redis_url: args.redis_url.clone(),
            s3: S3Config {
                region: args.s3_region.clone(),
                endpoint: args.s3_endpoint.clone().filter(|e| !e.is_empty()),
            },
            local_object_root: args.local_object_root.clone(),
            layout: RangeLayout::new(args.block_size_bytes, prefetch),
            global_s3_limit: args.global_s3_limit,
            per_bucket_s3_limit: args.per_bucket_s3_limit,
            timeout: Duration::from_secs(args.timeout_secs),
            resolver: ResolverConfig {
                lru_capacity: args.lru_capacity,
                ttl: Duration::from_secs(args.resolve_ttl_secs),
                ..ResolverConfig::filesystem()
            },
            mount_point: args.mount_point.clone(),
            metrics_addr,
        })
    }

    /// Resolver settings for one-shot lookups outside the mount.
    pub fn ingestion_resolver(&self) -> ResolverConfig {
        ResolverConfig {
            key_prefix: self.resolver.key_prefix.clone(),
            ..ResolverConfig::ingestion()
        }
    }
}

/// `host:port`, or `:port` for every interface. Empty means disabled.
fn parse_listen_addr(raw: &str) -> Result<Option<SocketAddr>, std::net::AddrParseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Some(port) = raw.strip_prefix(':') {
        return format!("0.0.0.0:{port}").parse::<SocketAddr>().map(Some);
    }
    raw.parse::<SocketAddr>().map(Some)
}
