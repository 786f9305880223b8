//! Read and write handles for single records.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::disk_cache::DiskCache;
use super::error::StorageError;
use crate::constants::DOWNLOAD_BUFFER_SIZE;

/// Read-only view of a committed record.
///
/// The file handle stays valid even if the record is evicted or replaced
/// after the snapshot was taken.
pub struct Snapshot {
    key: String,
    size: u64,
    file: File,
}

impl Snapshot {
    pub(crate) fn new(key: String, size: u64, file: File) -> Self {
        Self { key, size, file }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Size recorded in the index at commit time.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads the whole record.
    pub async fn read_all(mut self) -> Result<Bytes, StorageError> {
        let mut data = Vec::with_capacity(self.size as usize);
        self.file.read_to_end(&mut data).await?;
        Ok(Bytes::from(data))
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("key", &self.key)
            .field("size", &self.size)
            .finish()
    }
}

/// An open write to a record.
///
/// Bytes go to a staged file; nothing is visible to readers until
/// [`commit`](Self::commit) succeeds. Dropping an uncommitted transaction
/// aborts it; inside a tokio runtime the cleanup finishes shortly after on
/// the blocking pool.
pub struct Transaction {
    cache: Arc<DiskCache>,
    key: String,
    sink: BufWriter<File>,
    done: bool,
}

impl Transaction {
    pub(crate) fn new(cache: Arc<DiskCache>, key: String, file: File) -> Self {
        Self {
            cache,
            key,
            sink: BufWriter::with_capacity(DOWNLOAD_BUFFER_SIZE, file),
            done: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Destination for the record's bytes.
    pub fn sink(&mut self) -> &mut BufWriter<File> {
        &mut self.sink
    }

    /// Makes the staged bytes the record's committed value and returns the
    /// record size. On error the write is aborted.
    pub async fn commit(mut self) -> Result<u64, StorageError> {
        let size = self.publish_or_abort().await?;
        self.settle_committed(size).await?;
        Ok(size)
    }

    /// Commits like [`commit`](Self::commit) and returns the committed record
    /// already opened for reading.
    ///
    /// The record is opened before the index learns about the commit, so
    /// eviction triggered by this or any other write cannot take it away
    /// first.
    pub async fn commit_and_open(mut self) -> Result<Snapshot, StorageError> {
        let size = self.publish_or_abort().await?;
        let opened = File::open(self.cache.record_path(&self.key)).await;
        self.settle_committed(size).await?;
        Ok(Snapshot::new(self.key.clone(), size, opened?))
    }

    async fn publish_or_abort(&mut self) -> Result<u64, StorageError> {
        match self.publish().await {
            Ok(size) => Ok(size),
            Err(e) => {
                self.abort_inner().await;
                Err(e)
            }
        }
    }

    async fn settle_committed(&mut self, size: u64) -> Result<(), StorageError> {
        self.done = true;
        self.cache.complete_edit(&self.key, Some(size)).await?;
        debug!(key = %self.key, size, "record committed");
        Ok(())
    }

    async fn publish(&mut self) -> Result<u64, StorageError> {
        self.sink.flush().await?;
        let file = self.sink.get_ref();
        file.sync_all().await?;
        let size = file.metadata().await?.len();

        let max = self.cache.max_size();
        if size > max {
            return Err(StorageError::TooLarge { size, max });
        }

        tokio::fs::rename(
            self.cache.staged_path(&self.key),
            self.cache.record_path(&self.key),
        )
        .await?;
        Ok(size)
    }

    /// Discards the staged bytes. A previously committed value is kept.
    pub async fn abort(mut self) {
        self.abort_inner().await;
    }

    async fn abort_inner(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Err(e) = tokio::fs::remove_file(self.cache.staged_path(&self.key)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(key = %self.key, error = %e, "failed to remove staged record");
            }
        }
        if let Err(e) = self.cache.complete_edit(&self.key, None).await {
            warn!(key = %self.key, error = %e, "failed to record aborted write");
        }
        debug!(key = %self.key, "record write aborted");
    }
}

/// Abandons a write that was dropped without settling.
fn discard_staged(cache: &DiskCache, key: &str) {
    if let Err(e) = std::fs::remove_file(cache.staged_path(key)) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(key = %key, error = %e, "failed to remove staged record");
        }
    }
    if let Err(e) = cache.settle_edit(key, None) {
        warn!(key = %key, error = %e, "failed to record aborted write");
    }
    debug!(key = %key, "dropped record write discarded");
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let cache = Arc::clone(&self.cache);
        let key = self.key.clone();
        // Off the reactor when there is one.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || discard_staged(&cache, &key));
            }
            Err(_) => discard_staged(&cache, &key),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("key", &self.key)
            .field("done", &self.done)
            .finish()
    }
}
