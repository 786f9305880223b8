//! The fetch coordinator.
//!
//! [`ImageCache`] ties the tiers together. A request walks them in order:
//!
//! 1. memory tier, answered on the caller's thread
//! 2. persistent store, decoded with a reuse candidate from the reclaim pool
//! 3. origin, streamed into a store transaction, committed, then decoded from
//!    the committed record
//!
//! and promotes whatever it finds into the memory tier. Everything past the
//! memory tier runs on the tokio runtime the cache was built on, so a UI
//! thread calling [`ImageCache::request`] never blocks on disk or network.
//!
//! Concurrent requests for one key share a single fetch: the first request
//! starts it, later ones attach to it, and all of them get the same outcome
//! once the record is committed and decoded.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use pixtier::buffer::PixelFormat;
//! use pixtier::decode::{DecodeError, ReuseHint};
//! use pixtier::manager::{CacheConfig, ImageCacheBuilder, TargetSlot};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = ImageCacheBuilder::new(CacheConfig::new("/var/cache/app/images"))
//!     .decoder(|bytes: &[u8], hint: ReuseHint| {
//!         // A real decoder parses `bytes`.
//!         let _ = bytes;
//!         Ok::<_, DecodeError>(hint.allocate(64, 64, PixelFormat::Argb8888))
//!     })
//!     .build()
//!     .await?;
//!
//! // From async code:
//! let buffer = cache.load("https://example.com/cat.png").await?;
//! println!("{}x{}", buffer.width(), buffer.height());
//!
//! // From a UI callback:
//! let slot = TargetSlot::new(64, 64);
//! let assignment = slot.assign("https://example.com/dog.png");
//! cache.request("https://example.com/dog.png", Arc::clone(&slot), move |slot, result| {
//!     if let Ok(buffer) = result {
//!         slot.show(&assignment, buffer);
//!     }
//! });
//! # Ok(())
//! # }
//! ```

mod config;
mod in_flight;
mod target;

use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::buffer::{Buffer, PixelHeap};
use crate::cache::{MemoryCache, MemoryStats, PoolStats, ReclaimPool};
use crate::decode::{Decoder, ReuseHint};
use crate::error::CacheError;
use crate::fetch::{Downloader, HttpOrigin, Origin};
use crate::key::{CacheKey, KeyMapper};
use crate::storage::{DiskCache, StorageError};

pub use config::{CacheConfig, Capabilities, FlushPolicy};
pub use target::{Assignment, Target, TargetSlot};

use in_flight::{FlightGuard, InFlightTable, Outcome, Waiter};

/// Size a request is decoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SizeHint {
    width: u32,
    height: u32,
    sample: u32,
}

/// Snapshot of the cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory: MemoryStats,
    pub pool: PoolStats,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub origin_fetches: u64,
    pub origin_failures: u64,
    pub in_flight: usize,
}

/// Builds an [`ImageCache`].
pub struct ImageCacheBuilder {
    config: CacheConfig,
    decoder: Option<Arc<dyn Decoder>>,
    origin: Option<Arc<dyn Origin>>,
    heap: Option<Arc<PixelHeap>>,
    keys: Option<KeyMapper>,
}

impl ImageCacheBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            decoder: None,
            origin: None,
            heap: None,
            keys: None,
        }
    }

    /// Sets the decoder. Required.
    pub fn decoder(mut self, decoder: impl Decoder) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    /// Sets the origin. Defaults to [`HttpOrigin`].
    pub fn origin(mut self, origin: Arc<dyn Origin>) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Sets the heap decoded buffers are allocated from.
    pub fn heap(mut self, heap: Arc<PixelHeap>) -> Self {
        self.heap = Some(heap);
        self
    }

    pub fn key_mapper(mut self, keys: KeyMapper) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Validates the configuration, starts the reclaim sweep and opens the
    /// persistent store.
    ///
    /// A store that fails to open for I/O reasons leaves the cache running
    /// memory-only. Invalid configuration fails the build.
    pub async fn build(self) -> Result<ImageCache, CacheError> {
        let config = self.config;
        config.validate()?;

        let decoder = self
            .decoder
            .ok_or_else(|| CacheError::InvalidConfig("no decoder configured".into()))?;
        let origin: Arc<dyn Origin> = match self.origin {
            Some(origin) => origin,
            None => Arc::new(HttpOrigin::new()?),
        };
        let runtime = Handle::try_current()
            .map_err(|e| CacheError::InvalidConfig(format!("no tokio runtime: {}", e)))?;

        let keys = self.keys.unwrap_or_default();
        if keys.is_degraded() {
            warn!("cache keys use a non-cryptographic hash");
        }

        let reclaim = ReclaimPool::new(
            config.capabilities.reuse_mode(),
            config.decode_format,
            config.reclaim_capacity(),
        )
        .map_err(|e| CacheError::InvalidConfig(format!("failed to start reclaim sweep: {}", e)))?;
        let memory = MemoryCache::new(
            config.memory_capacity(),
            config.capabilities.size_strategy(),
            Arc::clone(&reclaim),
        );

        let disk = if config.memory_only {
            None
        } else {
            match DiskCache::open(
                &config.root_dir,
                config.schema_version,
                config.disk_capacity_bytes,
            )
            .await
            {
                Ok(disk) => Some(disk),
                Err(e) => {
                    warn!(
                        root = %config.root_dir.display(),
                        error = %e,
                        "disk tier unavailable, running memory-only"
                    );
                    None
                }
            }
        };

        info!(
            memory_capacity = memory.capacity(),
            reclaim_capacity = reclaim.parked_limit(),
            disk = disk.is_some(),
            reuse = ?reclaim.mode(),
            "image cache ready"
        );

        Ok(ImageCache {
            inner: Arc::new(Inner {
                keys,
                memory,
                reclaim,
                disk,
                downloader: Downloader::new(origin),
                decoder,
                heap: self.heap.unwrap_or_else(PixelHeap::new),
                in_flight: Arc::new(InFlightTable::new()),
                runtime,
                config,
            }),
        })
    }
}

struct Inner {
    keys: KeyMapper,
    memory: Arc<MemoryCache>,
    reclaim: Arc<ReclaimPool>,
    disk: Option<Arc<DiskCache>>,
    downloader: Downloader,
    decoder: Arc<dyn Decoder>,
    heap: Arc<PixelHeap>,
    in_flight: Arc<InFlightTable>,
    runtime: Handle,
    config: CacheConfig,
}

/// Two-tier image cache in front of an origin.
///
/// Share it behind an `Arc`. Dropping it stops the reclaim sweep; requests
/// still running finish normally.
pub struct ImageCache {
    inner: Arc<Inner>,
}

impl ImageCache {
    pub fn builder(config: CacheConfig) -> ImageCacheBuilder {
        ImageCacheBuilder::new(config)
    }

    /// Requests the image for `source_id` on behalf of `target`.
    ///
    /// `on_result` runs exactly once: right here on a memory hit, otherwise
    /// on a runtime worker once the image is available or the request
    /// failed. It gets `target` back so it can check that the target still
    /// wants this image before showing it.
    pub fn request<T, F>(&self, source_id: &str, target: Arc<T>, on_result: F)
    where
        T: Target,
        F: FnOnce(Arc<T>, Result<Arc<Buffer>, CacheError>) + Send + 'static,
    {
        let key = self.inner.keys.map(source_id);
        if let Some(buffer) = self.inner.memory.get(&key) {
            debug!(key = %key, "memory hit");
            on_result(target, Ok(buffer));
            return;
        }

        let (width, height) = target.size_hint();
        let hint = SizeHint {
            width,
            height,
            sample: target.sample_factor().max(1),
        };
        let waiter: Waiter = Box::new(move |outcome| on_result(target, outcome));
        self.inner.dispatch(key, source_id, hint, waiter);
    }

    /// Loads the image for `source_id` at the configured default size hint.
    pub async fn load(&self, source_id: &str) -> Result<Arc<Buffer>, CacheError> {
        let (width, height) = self.inner.config.default_size_hint;
        self.load_sized(source_id, width, height).await
    }

    /// Loads the image for `source_id`, picking reuse candidates for a
    /// `width` x `height` display.
    pub async fn load_sized(
        &self,
        source_id: &str,
        width: u32,
        height: u32,
    ) -> Result<Arc<Buffer>, CacheError> {
        let key = self.inner.keys.map(source_id);
        if let Some(buffer) = self.inner.memory.get(&key) {
            debug!(key = %key, "memory hit");
            return Ok(buffer);
        }

        let (tx, rx) = oneshot::channel();
        let hint = SizeHint {
            width,
            height,
            sample: 1,
        };
        self.inner.dispatch(
            key,
            source_id,
            hint,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        rx.await.unwrap_or(Err(CacheError::Cancelled))
    }

    /// Returns the image for `source_id` if it is resident in memory.
    pub fn get_if_present(&self, source_id: &str) -> Option<Arc<Buffer>> {
        self.inner.memory.get(&self.inner.keys.map(source_id))
    }

    /// Drops `source_id` from both tiers. Unknown ids are ignored; disk
    /// errors are logged and otherwise swallowed.
    ///
    /// A fetch already running for `source_id` still delivers to its
    /// waiters, but the record it commits is deleted from disk right away.
    pub async fn invalidate(&self, source_id: &str) {
        let key = self.inner.keys.map(source_id);
        let in_memory = self.inner.memory.remove(&key);

        if self.inner.in_flight.contains(&key) {
            debug!(key = %key, "invalidated while a fetch is running, its record will not be kept");
        }

        let on_disk = match &self.inner.disk {
            Some(disk) => match disk.remove(key.as_str()).await {
                Ok(removed) => removed,
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to remove record from disk tier");
                    false
                }
            },
            None => false,
        };
        debug!(key = %key, in_memory, on_disk, "invalidated");
    }

    /// Evicts every memory entry through the removal hook.
    pub fn clear_memory(&self) {
        self.inner.memory.clear();
    }

    /// Forces the persistent store's index to durable storage.
    pub async fn flush(&self) -> Result<(), CacheError> {
        match &self.inner.disk {
            Some(disk) => Ok(disk.flush().await?),
            None => Ok(()),
        }
    }

    /// The key `source_id` is stored under.
    pub fn key_for(&self, source_id: &str) -> CacheKey {
        self.inner.keys.map(source_id)
    }

    /// False when running memory-only, either by configuration or because
    /// the store failed to open.
    pub fn disk_enabled(&self) -> bool {
        self.inner.disk.is_some()
    }

    pub fn memory(&self) -> &Arc<MemoryCache> {
        &self.inner.memory
    }

    pub fn reclaim_pool(&self) -> &Arc<ReclaimPool> {
        &self.inner.reclaim
    }

    pub fn disk(&self) -> Option<&Arc<DiskCache>> {
        self.inner.disk.as_ref()
    }

    pub fn heap(&self) -> &Arc<PixelHeap> {
        &self.inner.heap
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        CacheStats {
            memory: inner.memory.stats(),
            pool: inner.reclaim.stats(),
            disk_entries: inner.disk.as_ref().map_or(0, |d| d.len()),
            disk_bytes: inner.disk.as_ref().map_or(0, |d| d.size()),
            origin_fetches: inner.downloader.fetches(),
            origin_failures: inner.downloader.failures(),
            in_flight: inner.in_flight.len(),
        }
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        self.inner.reclaim.shutdown();
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("disk_enabled", &self.disk_enabled())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Inner {
    /// Attaches `waiter` to the fetch for `key`, starting one on the runtime
    /// if none is pending.
    fn dispatch(self: &Arc<Self>, key: CacheKey, source_id: &str, hint: SizeHint, waiter: Waiter) {
        if !self.in_flight.join(&key, source_id, waiter) {
            return;
        }

        let inner = Arc::clone(self);
        let source_id = source_id.to_string();
        self.runtime.spawn(async move {
            let guard = FlightGuard::new(Arc::clone(&inner.in_flight), key.clone());
            let outcome = inner.resolve(&key, &source_id, hint).await;
            if let Err(e) = &outcome {
                warn!(key = %key, source = %source_id, error = %e, "request failed");
            }
            guard.resolve(outcome);
        });
    }

    /// Runs the lookup chain past the memory tier and promotes the result.
    async fn resolve(&self, key: &CacheKey, source_id: &str, hint: SizeHint) -> Outcome {
        // Another flight for this key may have finished between the caller's
        // memory check and this one starting.
        if let Some(buffer) = self.memory.get(key) {
            return Ok(buffer);
        }

        let mut candidate = self
            .reclaim
            .acquire_candidate(hint.width, hint.height, hint.sample);

        let buffer = match &self.disk {
            Some(disk) => match self.lookup_disk(disk, key, &mut candidate).await {
                Some(buffer) => buffer,
                None => {
                    self.fetch_to_disk(disk, key, source_id, candidate)
                        .await?
                }
            },
            None => {
                let bytes = self.downloader.fetch_to_memory(source_id).await?;
                self.decode(bytes, candidate).await?
            }
        };

        let buffer = Arc::new(buffer);
        self.memory.put(key.clone(), Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Reads and decodes the committed record for `key`. Read errors count as
    /// a miss; a record that does not decode is deleted.
    async fn lookup_disk(
        &self,
        disk: &Arc<DiskCache>,
        key: &CacheKey,
        candidate: &mut Option<Arc<Buffer>>,
    ) -> Option<Buffer> {
        let bytes = match self.read_record(disk, key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(key = %key, "disk miss");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "disk read failed, treating as miss");
                return None;
            }
        };

        match self.decode(bytes, candidate.take()).await {
            Ok(buffer) => {
                debug!(key = %key, "disk hit");
                Some(buffer)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "discarding undecodable disk record");
                if let Err(e) = disk.remove(key.as_str()).await {
                    warn!(key = %key, error = %e, "failed to remove undecodable record");
                }
                None
            }
        }
    }

    async fn read_record(
        &self,
        disk: &Arc<DiskCache>,
        key: &CacheKey,
    ) -> Result<Option<Bytes>, StorageError> {
        match disk.read(key.as_str()).await? {
            Some(snapshot) => Ok(Some(snapshot.read_all().await?)),
            None => Ok(None),
        }
    }

    /// Downloads into a store transaction, commits it and decodes the
    /// committed record, opened as part of the commit.
    async fn fetch_to_disk(
        &self,
        disk: &Arc<DiskCache>,
        key: &CacheKey,
        source_id: &str,
        candidate: Option<Arc<Buffer>>,
    ) -> Result<Buffer, CacheError> {
        let Some(mut transaction) = disk.begin_write(key.as_str()).await? else {
            return Err(CacheError::WriterBusy(key.to_string()));
        };

        debug!(key = %key, source = %source_id, "fetching from origin");
        if let Err(e) = self
            .downloader
            .fetch_to_transaction(source_id, &mut transaction)
            .await
        {
            transaction.abort().await;
            return Err(e.into());
        }
        let committed = transaction.commit_and_open().await?;

        if self.config.flush_policy == FlushPolicy::EveryCommit {
            if let Err(e) = disk.flush().await {
                warn!(key = %key, error = %e, "disk tier flush failed");
            }
        }

        let bytes = committed.read_all().await?;
        let decoded = self.decode(bytes, candidate).await;
        if decoded.is_err() {
            // Keep the next request from hitting the same bad bytes on disk.
            if let Err(e) = disk.remove(key.as_str()).await {
                warn!(key = %key, error = %e, "failed to remove undecodable record");
            }
        }
        decoded
    }

    /// Decodes on the blocking pool.
    async fn decode(&self, bytes: Bytes, candidate: Option<Arc<Buffer>>) -> Result<Buffer, CacheError> {
        let decoder = Arc::clone(&self.decoder);
        let hint = ReuseHint::new(
            candidate,
            Arc::clone(&self.heap),
            self.config.decode_format,
            self.config.mutable_buffers,
        );
        match tokio::task::spawn_blocking(move || decoder.decode(&bytes, hint)).await {
            Ok(result) => Ok(result?),
            Err(e) => {
                warn!(error = %e, "decode task failed");
                Err(CacheError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests;
