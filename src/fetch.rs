//! Fetching sources from their origin.
//!
//! # Overview
//!
//! - [`Origin`] - the raw byte-stream fetch, `fetch(url, sink)`
//! - [`HttpOrigin`] - the default origin, plain HTTP(S) GET via `reqwest`
//! - [`Downloader`] - drives an origin into a persistent-store transaction or
//!   an in-memory buffer
//!
//! Origins stream into the sink they are given; the whole payload is never
//! held in memory on the way to disk. No fetch is ever retried here; a failed
//! request surfaces to its callers, who may ask again.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use pixtier::fetch::{Downloader, HttpOrigin};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let downloader = Downloader::new(Arc::new(HttpOrigin::new()?));
//! let bytes = downloader.fetch_to_memory("https://example.com/cat.png").await?;
//! println!("{} bytes", bytes.len());
//! # Ok(())
//! # }
//! ```

mod error;
mod http;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWrite;
use tracing::debug;

use crate::storage::Transaction;

pub use error::DownloadError;
pub use http::HttpOrigin;

/// Source of encoded image bytes.
#[async_trait]
pub trait Origin: Send + Sync + 'static {
    /// Streams the body found at `url` into `sink` and returns the number of
    /// bytes written. Any transport error, non-success response or malformed
    /// url is a failure.
    async fn fetch(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, DownloadError>;
}

/// Runs origin fetches on behalf of the cache and counts them.
pub struct Downloader {
    origin: Arc<dyn Origin>,
    fetches: AtomicU64,
    failures: AtomicU64,
}

impl Downloader {
    pub fn new(origin: Arc<dyn Origin>) -> Self {
        Self {
            origin,
            fetches: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Streams `url` into an open store transaction. The caller commits or
    /// aborts the transaction depending on the outcome.
    pub async fn fetch_to_transaction(
        &self,
        url: &str,
        transaction: &mut Transaction,
    ) -> Result<u64, DownloadError> {
        let result = self.run(url, transaction.sink()).await;
        if let Ok(bytes) = result {
            debug!(url, key = transaction.key(), bytes, "download staged");
        }
        result
    }

    /// Fetches `url` into memory. Used when there is no disk tier to land on.
    pub async fn fetch_to_memory(&self, url: &str) -> Result<Bytes, DownloadError> {
        let mut sink = Vec::new();
        self.run(url, &mut sink).await?;
        Ok(Bytes::from(sink))
    }

    async fn run(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, DownloadError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let result = self.origin.fetch(url, sink).await;
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Number of origin fetches started.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Number of origin fetches that failed.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("fetches", &self.fetches())
            .field("failures", &self.failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskCache;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    struct StaticOrigin {
        body: &'static [u8],
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl Origin for StaticOrigin {
        async fn fetch(
            &self,
            _url: &str,
            sink: &mut (dyn AsyncWrite + Unpin + Send),
        ) -> Result<u64, DownloadError> {
            match self.fail_after {
                Some(n) => {
                    sink.write_all(&self.body[..n]).await?;
                    Err(DownloadError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "connection reset",
                    )))
                }
                None => {
                    sink.write_all(self.body).await?;
                    Ok(self.body.len() as u64)
                }
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_to_memory() {
        let downloader = Downloader::new(Arc::new(StaticOrigin {
            body: b"payload",
            fail_after: None,
        }));
        let bytes = downloader.fetch_to_memory("mem://a").await.unwrap();
        assert_eq!(&bytes[..], b"payload");
        assert_eq!(downloader.fetches(), 1);
        assert_eq!(downloader.failures(), 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_into_transaction_leaves_no_record() {
        let temp = TempDir::new().unwrap();
        let store = DiskCache::open(temp.path(), 1, 1024).await.unwrap();
        let downloader = Downloader::new(Arc::new(StaticOrigin {
            body: b"payload",
            fail_after: Some(3),
        }));

        let mut tx = store.begin_write("k1").await.unwrap().unwrap();
        let result = downloader.fetch_to_transaction("mem://a", &mut tx).await;
        assert!(matches!(result, Err(DownloadError::Io(_))));
        tx.abort().await;

        assert!(store.read("k1").await.unwrap().is_none());
        assert_eq!(downloader.failures(), 1);
    }

    #[tokio::test]
    async fn test_fetch_into_transaction_commits() {
        let temp = TempDir::new().unwrap();
        let store = DiskCache::open(temp.path(), 1, 1024).await.unwrap();
        let downloader = Downloader::new(Arc::new(StaticOrigin {
            body: b"payload",
            fail_after: None,
        }));

        let mut tx = store.begin_write("k1").await.unwrap().unwrap();
        downloader.fetch_to_transaction("mem://a", &mut tx).await.unwrap();
        assert_eq!(tx.commit().await.unwrap(), 7);

        let snapshot = store.read("k1").await.unwrap().unwrap();
        assert_eq!(&snapshot.read_all().await.unwrap()[..], b"payload");
    }
}
