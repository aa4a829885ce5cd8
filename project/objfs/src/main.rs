use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use objfs::cache::{DistributedCache, RedisCache};
use objfs::cadapter::{LocalFsBackend, RangeBackend, S3RangeBackend};
use objfs::cli::{Args, Command, IngestArgs};
use objfs::config::Config;
use objfs::fuse::mount::mount_read_only;
use objfs::meta::{IngestRecorder, MetaRepository, NewObject, PgMetaRepository, Resolver};
use objfs::metrics::{Metrics, serve as serve_metrics};
use objfs::range::RangeReader;
use objfs::util::with_deadline;
use objfs::vfs::ObjectFs;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level);
    let config = Config::from_args(&args)?;

    let repo: Arc<dyn MetaRepository> = Arc::new(
        PgMetaRepository::connect(
            &config.postgres_dsn,
            config.db_max_connections,
            config.timeout,
        )
        .await
        .context("failed to connect to the metadata store")?,
    );
    let redis: Arc<dyn DistributedCache> = Arc::new(
        RedisCache::connect(&config.redis_url)
            .await
            .context("failed to connect to redis")?,
    );

    match args.subcommand() {
        Command::Mount => match &config.local_object_root {
            Some(root) => serve(&config, repo, redis, LocalFsBackend::new(root)).await,
            None => {
                let backend = S3RangeBackend::new(&config.s3).await;
                serve(&config, repo, redis, backend).await
            }
        },
        Command::Resolve { path, date } => resolve(&config, repo, redis, &path, date).await,
        Command::Ingest(ingest) => ingest_one(repo, redis, ingest).await,
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve<B>(
    config: &Config,
    repo: Arc<dyn MetaRepository>,
    remote: Arc<dyn DistributedCache>,
    backend: B,
) -> Result<()>
where
    B: RangeBackend + 'static,
{
    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
    let resolver = Arc::new(Resolver::new(
        repo,
        remote,
        config.resolver.clone(),
        metrics.clone(),
    ));
    let reader = Arc::new(RangeReader::new(
        backend,
        config.global_s3_limit,
        config.per_bucket_s3_limit,
        metrics.clone(),
    ));
    let fs = ObjectFs::new(resolver, reader, config.layout, config.timeout);

    let metrics_shutdown = CancellationToken::new();
    if let Some(addr) = config.metrics_addr {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics endpoint {addr}"))?;
        tokio::spawn(serve_metrics(listener, metrics, metrics_shutdown.clone()));
    }

    let mut mount_handle = mount_read_only(fs, &config.mount_point)
        .await
        .with_context(|| format!("failed to mount {}", config.mount_point.display()))?;
    info!(
        mount_point = %config.mount_point.display(),
        block = config.layout.block_size,
        prefetch = config.layout.prefetch_size,
        "objfs mounted"
    );

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.context("fuse session failed")?,
        _ = shutdown_signal() => {
            mount_handle.unmount().await.context("failed to unmount")?;
        }
    }
    metrics_shutdown.cancel();
    info!("objfs stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutting down");
}

async fn resolve(
    config: &Config,
    repo: Arc<dyn MetaRepository>,
    remote: Arc<dyn DistributedCache>,
    path: &str,
    date: Option<NaiveDate>,
) -> Result<()> {
    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
    let resolver = Resolver::new(repo, remote, config.ingestion_resolver(), metrics);
    let cancel = CancellationToken::new();
    let lookup = async {
        match date {
            Some(date) => resolver.resolve_in_partition(path, date, &cancel).await,
            None => resolver.resolve(path, &cancel).await,
        }
    };
    let record = with_deadline(&cancel, config.timeout, lookup).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn ingest_one(
    repo: Arc<dyn MetaRepository>,
    events: Arc<dyn DistributedCache>,
    args: IngestArgs,
) -> Result<()> {
    let object = NewObject {
        virtual_path: args.virtual_path,
        bucket: args.bucket,
        key: args.key,
        size: args.size,
        etag: args.etag,
        last_modified: args.last_modified.unwrap_or_else(Utc::now),
        storage_class: args.storage_class,
        version_id: args.version_id,
        checksum_md5: args.checksum_md5,
        checksum_sha256: args.checksum_sha256,
    };
    let partition = args.partition.unwrap_or_else(|| Utc::now().date_naive());
    let record = IngestRecorder::new(repo, events)
        .record(object, partition, args.status)
        .await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
