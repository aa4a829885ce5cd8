//! Prometheus counters for the resolver and the range reader, and the
//! `/metrics` endpoint that exposes them.
//!
//! Each [`Metrics`] owns its registry, so tests and one-shot commands can
//! build as many as they like without clashing in the process-global one.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TEXT_FORMAT, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Metrics {
    registry: Registry,
    pub local_hits: IntCounter,
    pub remote_hits: IntCounter,
    pub repository_queries: IntCounter,
    pub cache_write_failures: IntCounter,
    pub range_requests: IntCounter,
    pub range_bytes: IntCounter,
    pub range_failures: IntCounter,
    /// Fetches currently holding both a global and a bucket permit.
    pub range_permits_in_use: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("objfs".to_string()), None)?;
        Ok(Self {
            local_hits: counter(
                &registry,
                "resolver_local_hits_total",
                "Resolutions served by the in-process cache",
            )?,
            remote_hits: counter(
                &registry,
                "resolver_remote_hits_total",
                "Resolutions served by the distributed cache",
            )?,
            repository_queries: counter(
                &registry,
                "resolver_repository_queries_total",
                "Resolutions that reached the metadata repository",
            )?,
            cache_write_failures: counter(
                &registry,
                "resolver_cache_write_failures_total",
                "Distributed cache writes that failed after a successful resolution",
            )?,
            range_requests: counter(
                &registry,
                "range_requests_total",
                "Ranged backend fetches issued",
            )?,
            range_bytes: counter(
                &registry,
                "range_bytes_total",
                "Bytes returned by ranged backend fetches",
            )?,
            range_failures: counter(
                &registry,
                "range_failures_total",
                "Ranged backend fetches that failed",
            )?,
            range_permits_in_use: {
                let gauge = IntGauge::new(
                    "range_permits_in_use",
                    "Ranged fetches currently admitted by both semaphores",
                )?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            },
            registry,
        })
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(buf)
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Response for one request path: the exposition on `/metrics`, 404 elsewhere.
pub fn render(metrics: &Metrics, path: &str) -> Response<Full<Bytes>> {
    let (status, content_type, body) = match path {
        "/metrics" => match metrics.encode() {
            Ok(text) => (StatusCode::OK, TEXT_FORMAT, text),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string().into_bytes(),
            ),
        },
        _ => (StatusCode::NOT_FOUND, "text/plain", b"not found".to_vec()),
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Serve `/metrics` on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, metrics: Arc<Metrics>, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "metrics server listening");
    }
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "metrics accept failed");
                continue;
            }
        };
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = render(&metrics, req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%peer, error = %e, "metrics connection error");
            }
        });
    }
    debug!("metrics server stopped");
}
