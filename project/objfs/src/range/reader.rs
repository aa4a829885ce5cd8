//! Ranged object reader with two-level admission control.
//!
//! Every fetch holds one permit of the global semaphore and one of its
//! bucket's semaphore for the whole backend call. Permits are RAII guards, so
//! they are returned on success, error and cancellation alike.
//!
//! A fetch succeeds only with the whole requested range. The VFS never asks
//! past the object size it has on record, so a short body means the object
//! changed after it was indexed and is reported as a backend error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use prometheus::IntGauge;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cadapter::RangeBackend;
use crate::error::{ObjfsError, Result};
use crate::metrics::Metrics;
use crate::util::cancellable;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub requests: u64,
    pub bytes: u64,
    pub failures: u64,
}

pub struct RangeReader<B: RangeBackend> {
    backend: B,
    global: Arc<Semaphore>,
    per_bucket_limit: usize,
    // Grows with the bucket set and is never pruned.
    buckets: Mutex<HashMap<String, Arc<Semaphore>>>,
    metrics: Arc<Metrics>,
}

/// Holds the in-use gauge up for one admitted fetch.
struct Admitted<'a>(&'a IntGauge);

impl<'a> Admitted<'a> {
    fn new(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

impl<B: RangeBackend> RangeReader<B> {
    /// Limits of zero are raised to one.
    pub fn new(
        backend: B,
        global_limit: usize,
        per_bucket_limit: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            global: Arc::new(Semaphore::new(global_limit.max(1))),
            per_bucket_limit: per_bucket_limit.max(1),
            buckets: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn stats(&self) -> ReaderStats {
        ReaderStats {
            requests: self.metrics.range_requests.get(),
            bytes: self.metrics.range_bytes.get(),
            failures: self.metrics.range_failures.get(),
        }
    }

    /// Fetches currently admitted.
    pub fn permits_in_use(&self) -> i64 {
        self.metrics.range_permits_in_use.get()
    }

    /// Permits currently free in the global pool.
    pub fn available_global_permits(&self) -> usize {
        self.global.available_permits()
    }

    /// Permits currently free for `bucket`; `None` if it was never touched.
    pub fn available_bucket_permits(&self, bucket: &str) -> Option<usize> {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bucket)
            .map(|s| s.available_permits())
    }

    /// The bucket's semaphore, created on first use. Creation happens under
    /// the map lock, so a bucket never gets two pools.
    fn bucket_semaphore(&self, bucket: &str) -> Arc<Semaphore> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sem) = buckets.get(bucket) {
            return sem.clone();
        }
        let sem = Arc::new(Semaphore::new(self.per_bucket_limit));
        buckets.insert(bucket.to_string(), sem.clone());
        sem
    }

    /// Fetch the inclusive range `[start, end]` of `bucket/key`.
    ///
    /// Waits for a global permit, then for a bucket permit; either wait and
    /// the fetch itself abort with [`ObjfsError::Cancelled`] when `cancel`
    /// fires. The returned buffer holds exactly `end - start + 1` bytes.
    pub async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if end < start {
            return Err(ObjfsError::InvalidRange { start, end });
        }

        let _global = cancellable(cancel, async {
            self.global
                .acquire()
                .await
                .map_err(|_| ObjfsError::Cancelled)
        })
        .await?;
        let bucket_sem = self.bucket_semaphore(bucket);
        let _bucket = cancellable(cancel, async {
            bucket_sem.acquire().await.map_err(|_| ObjfsError::Cancelled)
        })
        .await?;

        let _admitted = Admitted::new(&self.metrics.range_permits_in_use);
        self.metrics.range_requests.inc();
        let fetched = cancellable(cancel, self.backend.get_range(bucket, key, start, end))
            .await
            .and_then(|body| {
                let expected = (end - start).saturating_add(1);
                if body.len() as u64 == expected {
                    Ok(body)
                } else {
                    Err(ObjfsError::backend(
                        bucket,
                        key,
                        format!("expected {expected} bytes, got {}", body.len()),
                    ))
                }
            });
        match fetched {
            Ok(body) => {
                self.metrics.range_bytes.inc_by(body.len() as u64);
                debug!(bucket, key, start, end, len = body.len(), "range fetched");
                Ok(body)
            }
            Err(e) => {
                self.metrics.range_failures.inc();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Backend that sleeps per call and records the peak number of
    /// overlapping calls.
    #[derive(Default)]
    struct SlowBackend {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        delay_ms: u64,
        fail: bool,
        short: bool,
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    impl SlowBackend {
        fn with_delay(delay_ms: u64) -> Self {
            Self {
                delay_ms,
                ..Default::default()
            }
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RangeBackend for SlowBackend {
        async fn get_range(&self, _bucket: &str, _key: &str, start: u64, end: u64) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(ObjfsError::backend("b", "k", "503 SlowDown"));
            }
            let len = (end - start + 1) as usize;
            if self.short {
                return Ok(Bytes::from(vec![7u8; len - 1]));
            }
            Ok(Bytes::from(vec![7u8; len]))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_global_limit_serializes_buckets() {
        let reader = Arc::new(RangeReader::new(SlowBackend::with_delay(50), 1, 10, metrics()));
        let token = CancellationToken::new();
        let (a, b) = tokio::join!(
            reader.get_range("bucket-a", "k", 0, 9, &token),
            reader.get_range("bucket-b", "k", 0, 9, &token),
        );
        assert_eq!(a.unwrap().len(), 10);
        assert_eq!(b.unwrap().len(), 10);
        assert_eq!(reader.backend().peak(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_buckets_run_concurrently() {
        let reader = Arc::new(RangeReader::new(SlowBackend::with_delay(100), 10, 1, metrics()));
        let token = CancellationToken::new();
        let (a, b) = tokio::join!(
            reader.get_range("bucket-a", "k", 0, 9, &token),
            reader.get_range("bucket-b", "k", 0, 9, &token),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(reader.backend().peak(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_bucket_limit_serializes_same_bucket() {
        let reader = Arc::new(RangeReader::new(SlowBackend::with_delay(50), 10, 1, metrics()));
        let token = CancellationToken::new();
        let (a, b) = tokio::join!(
            reader.get_range("bucket-a", "k1", 0, 9, &token),
            reader.get_range("bucket-a", "k2", 0, 9, &token),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(reader.backend().peak(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_releases_nothing_and_skips_backend() {
        let reader = Arc::new(RangeReader::new(SlowBackend::with_delay(200), 1, 1, metrics()));
        let holder_token = CancellationToken::new();
        let waiter_token = CancellationToken::new();

        let holder = {
            let reader = reader.clone();
            let token = holder_token.clone();
            tokio::spawn(async move { reader.get_range("b", "k", 0, 0, &token).await })
        };
        // Let the holder take the only permit.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reader.available_global_permits(), 0);

        let waiter = {
            let reader = reader.clone();
            let token = waiter_token.clone();
            tokio::spawn(async move { reader.get_range("b", "k", 0, 0, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_token.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(ObjfsError::Cancelled)));

        holder.await.unwrap().unwrap();
        assert_eq!(reader.backend().calls.load(Ordering::SeqCst), 1);
        assert_eq!(reader.available_global_permits(), 1);
        assert_eq!(reader.available_bucket_permits("b"), Some(1));
    }

    #[tokio::test]
    async fn test_cancel_during_fetch_returns_permits() {
        let reader = Arc::new(RangeReader::new(SlowBackend::with_delay(5_000), 2, 2, metrics()));
        let token = CancellationToken::new();
        let task = {
            let reader = reader.clone();
            let token = token.clone();
            tokio::spawn(async move { reader.get_range("b", "k", 0, 0, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reader.available_global_permits(), 1);
        assert_eq!(reader.permits_in_use(), 1);
        token.cancel();
        assert!(matches!(task.await.unwrap(), Err(ObjfsError::Cancelled)));
        assert_eq!(reader.permits_in_use(), 0);
        assert_eq!(reader.available_global_permits(), 2);
        assert_eq!(reader.available_bucket_permits("b"), Some(2));
    }

    #[tokio::test]
    async fn test_backend_error_returns_permits() {
        let backend = SlowBackend {
            fail: true,
            ..Default::default()
        };
        let reader = RangeReader::new(backend, 3, 3, metrics());
        let err = reader
            .get_range("b", "k", 0, 9, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(reader.available_global_permits(), 3);
        assert_eq!(reader.available_bucket_permits("b"), Some(3));
        assert_eq!(reader.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_short_body_is_a_backend_error() {
        let backend = SlowBackend {
            short: true,
            ..Default::default()
        };
        let reader = RangeReader::new(backend, 2, 2, metrics());
        let err = reader
            .get_range("b", "shrunk", 0, 9, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ObjfsError::Backend { .. }), "{err}");
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(reader.stats().failures, 1);
        assert_eq!(reader.stats().bytes, 0);
        assert_eq!(reader.permits_in_use(), 0);
        assert_eq!(reader.available_global_permits(), 2);
    }

    #[tokio::test]
    async fn test_successful_fetches_are_counted() {
        let reader = RangeReader::new(SlowBackend::default(), 2, 2, metrics());
        let token = CancellationToken::new();
        reader.get_range("b", "k", 0, 99, &token).await.unwrap();
        reader.get_range("b", "k", 100, 149, &token).await.unwrap();
        assert_eq!(
            reader.stats(),
            ReaderStats {
                requests: 2,
                bytes: 150,
                failures: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_one_pool_per_bucket_under_contention() {
        let reader = Arc::new(RangeReader::new(SlowBackend::with_delay(1), 64, 4, metrics()));
        let token = CancellationToken::new();
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let reader = reader.clone();
                let token = token.clone();
                tokio::spawn(async move { reader.get_range("shared", "k", 0, 0, &token).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(reader.buckets.lock().unwrap().len(), 1);
        assert!(reader.backend().peak() <= 4);
    }

    #[tokio::test]
    async fn test_inverted_range_is_rejected() {
        let reader = RangeReader::new(SlowBackend::default(), 1, 1, metrics());
        let err = reader
            .get_range("b", "k", 10, 9, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ObjfsError::InvalidRange { start: 10, end: 9 }));
        assert_eq!(reader.backend().calls.load(Ordering::SeqCst), 0);
    }
}
