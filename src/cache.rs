//! The in-memory tier and the buffer reuse pool.
//!
//! # Overview
//!
//! - [`MemoryCache`] - byte-bounded LRU of decoded buffers
//! - [`ReclaimPool`] - evicted mutable buffers, offered back to the decoder as
//!   reuse candidates
//!
//! The two are wired together through the memory tier's removal hook: a
//! mutable buffer leaving the LRU goes to the pool, an immutable one is
//! dropped. The pool tracks a buffer weakly while something else still holds
//! it. A dedicated sweep thread takes over its storage once the last
//! reference is gone, and releases storage the pool has no room for.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use pixtier::buffer::{Buffer, PixelFormat, PixelHeap, SizeStrategy};
//! use pixtier::cache::{MemoryCache, ReclaimPool, ReuseMode};
//! use pixtier::key::KeyMapper;
//!
//! let heap = PixelHeap::new();
//! let pool = ReclaimPool::new(ReuseMode::Strict, PixelFormat::Argb8888, 1024 * 1024).unwrap();
//! let cache = MemoryCache::new(1024 * 1024, SizeStrategy::AllocationSize, Arc::clone(&pool));
//!
//! let key = KeyMapper::new().map("https://example.com/cat.png");
//! let shown = Arc::new(Buffer::allocate(&heap, 64, 64, PixelFormat::Argb8888, true));
//! cache.put(key.clone(), Arc::clone(&shown));
//! assert!(cache.get(&key).is_some());
//!
//! // Removing it hands the buffer to the pool while it is still on screen.
//! cache.remove(&key);
//! let candidate = pool.acquire_candidate(64, 64, 1).unwrap();
//! assert!(Arc::ptr_eq(&candidate, &shown));
//! ```

mod memory_cache;
mod reclaim_pool;

pub use memory_cache::{MemoryCache, MemoryStats};
pub use reclaim_pool::{PoolStats, ReclaimNotice, ReclaimPool, ReuseMode, SWEEP_THREAD_NAME};
