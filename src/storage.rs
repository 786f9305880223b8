//! Persistent record store.
//!
//! This module provides the disk tier: a directory of opaque byte records
//! keyed by file-name-safe strings, bounded by total size and evicted in
//! least-recently-used order.
//!
//! # Overview
//!
//! - [`DiskCache`] - the store; one per directory
//! - [`Snapshot`] - a committed record opened for reading
//! - [`Transaction`] - a staged write that becomes visible on commit
//!
//! At most one write per key is open at a time. Committing replaces the
//! previous value atomically; aborting (or dropping the transaction) leaves
//! it untouched. The store survives restarts: an index file records which
//! records exist, their sizes and their recency. Writes interrupted by a
//! crash are cleaned up on the next open.
//!
//! # Examples
//!
//! ```no_run
//! use pixtier::storage::DiskCache;
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = DiskCache::open("/tmp/pixtier", 1, 10 * 1024 * 1024).await?;
//!
//! if let Some(mut tx) = store.begin_write("0a1b2c").await? {
//!     tx.sink().write_all(b"encoded image bytes").await?;
//!     tx.commit().await?;
//! }
//!
//! if let Some(snapshot) = store.read("0a1b2c").await? {
//!     let bytes = snapshot.read_all().await?;
//!     assert_eq!(&bytes[..], b"encoded image bytes");
//! }
//! # Ok(())
//! # }
//! ```

mod disk_cache;
mod error;
mod journal;
mod record;

pub use disk_cache::DiskCache;
pub use error::StorageError;
pub use journal::is_valid_key;
pub use record::{Snapshot, Transaction};
