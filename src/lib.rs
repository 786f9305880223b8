//! pixtier - A two-tier image cache
//!
//! This library caches decoded image buffers in front of a remote origin:
//! a byte-bounded memory tier, a persistent disk tier that doubles as the
//! landing zone for downloads, and a reuse pool that hands the storage of
//! evicted buffers back to the decoder.
//!
//! # Modules
//!
//! - [`manager`] - The fetch coordinator ([`ImageCache`]), configuration, display targets
//! - [`cache`] - Memory tier and reclaim pool
//! - [`storage`] - Persistent, journal-indexed record store
//! - [`fetch`] - Origin trait, HTTP origin, downloader
//! - [`buffer`] - Decoded buffers and pixel memory accounting
//! - [`decode`] - Decoder seam and reuse hints
//! - [`key`] - Cache keys from source identifiers
//!
//! # Examples
//!
//! ```no_run
//! use pixtier::{CacheConfig, ImageCacheBuilder};
//! use pixtier::buffer::PixelFormat;
//! use pixtier::decode::{DecodeError, ReuseHint};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = ImageCacheBuilder::new(CacheConfig::new("/var/cache/app/images"))
//!     .decoder(|_bytes: &[u8], hint: ReuseHint| {
//!         Ok::<_, DecodeError>(hint.allocate(32, 32, PixelFormat::Argb8888))
//!     })
//!     .build()
//!     .await?;
//!
//! let avatar = cache.load("https://example.com/avatar.png").await?;
//! assert_eq!(avatar.width(), 32);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cache;
pub mod constants;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod key;
pub mod manager;
pub mod storage;

pub use buffer::{Buffer, PixelFormat, PixelHeap, SizeStrategy};
pub use cache::{MemoryCache, MemoryStats, PoolStats, ReclaimPool, ReuseMode};
pub use decode::{DecodeError, Decoder, ReuseHint};
pub use error::CacheError;
pub use fetch::{DownloadError, Downloader, HttpOrigin, Origin};
pub use key::{CacheKey, KeyMapper};
pub use manager::{
    Assignment, CacheConfig, CacheStats, Capabilities, FlushPolicy, ImageCache,
    ImageCacheBuilder, Target, TargetSlot,
};
pub use storage::{DiskCache, Snapshot, StorageError, Transaction};
