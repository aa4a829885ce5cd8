use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::meta::ObjectStatus;
use crate::range::{DEFAULT_BLOCK_SIZE, DEFAULT_PREFETCH_SIZE};

#[derive(Parser, Debug)]
#[command(name = "objfs", version, about = "Read-only FUSE view of object storage", long_about = None)]
pub struct Args {
    /// PostgreSQL connection string for the metadata index
    #[arg(long, env = "POSTGRES_DSN", default_value = "")]
    pub postgres_dsn: String,

    /// Maximum connections in the metadata pool
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 16)]
    pub db_max_connections: u32,

    /// Redis URL for the shared resolution cache and ingest events
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/0")]
    pub redis_url: String,

    /// S3 region
    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    /// Custom S3 endpoint (MinIO, RustFS, ...); enables path-style addressing
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// Serve objects from `<dir>/<bucket>/<key>` instead of S3
    #[arg(long, env = "LOCAL_OBJECT_ROOT")]
    pub local_object_root: Option<PathBuf>,

    /// Alignment unit for backend range requests
    #[arg(long, env = "BLOCK_SIZE_BYTES", default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size_bytes: u64,

    /// Upper bound on one backend range request
    #[arg(long, env = "PREFETCH_SIZE_BYTES", default_value_t = DEFAULT_PREFETCH_SIZE)]
    pub prefetch_size_bytes: u64,

    /// Concurrent backend requests across all buckets
    #[arg(long, env = "GLOBAL_S3_LIMIT", default_value_t = 200)]
    pub global_s3_limit: usize,

    /// Concurrent backend requests per bucket
    #[arg(long, env = "PER_BUCKET_S3_LIMIT", default_value_t = 20)]
    pub per_bucket_s3_limit: usize,

    /// Deadline for one lookup or read, in seconds
    #[arg(long, env = "TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Entries in the in-process resolution cache
    #[arg(long, env = "LRU_CAPACITY", default_value_t = 50_000)]
    pub lru_capacity: usize,

    /// TTL of shared resolution cache entries, in seconds
    #[arg(long, env = "RESOLVE_TTL_SECS", default_value_t = 1800)]
    pub resolve_ttl_secs: u64,

    /// Empty directory to mount on
    #[arg(long, env = "FUSE_MOUNT_POINT", default_value = "/mnt/virtualfs")]
    pub mount_point: PathBuf,

    /// Listen address for the Prometheus `/metrics` endpoint; empty disables it
    #[arg(long, env = "METRICS_ADDR", default_value = ":9090")]
    pub metrics_addr: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Mount the filesystem and serve until interrupted (default)
    Mount,
    /// Resolve one virtual path and print its record as JSON
    Resolve {
        #[arg(value_name = "VIRTUAL_PATH")]
        path: String,
        /// Pin the lookup to one ingestion date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Record one object in the metadata index
    Ingest(IngestArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct IngestArgs {
    #[arg(long)]
    pub virtual_path: String,
    #[arg(long)]
    pub bucket: String,
    #[arg(long)]
    pub key: String,
    #[arg(long)]
    pub size: u64,
    #[arg(long)]
    pub etag: String,
    /// RFC 3339; defaults to now
    #[arg(long)]
    pub last_modified: Option<DateTime<Utc>>,
    #[arg(long)]
    pub storage_class: Option<String>,
    #[arg(long)]
    pub version_id: Option<String>,
    #[arg(long)]
    pub checksum_md5: Option<String>,
    #[arg(long)]
    pub checksum_sha256: Option<String>,
    /// Ingestion date; defaults to today (UTC)
    #[arg(long)]
    pub partition: Option<NaiveDate>,
    /// active, pending or deleted
    #[arg(long, default_value = "active")]
    pub status: ObjectStatus,
}

impl Args {
    /// The subcommand to run; `mount` when none was given.
    pub fn subcommand(&self) -> Command {
        self.command.clone().unwrap_or(Command::Mount)
    }
}
