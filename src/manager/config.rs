use std::path::PathBuf;

use crate::buffer::{PixelFormat, SizeStrategy};
use crate::cache::ReuseMode;
use crate::constants::{
    DEFAULT_DISK_CAPACITY_BYTES, DEFAULT_MEMORY_FRACTION, DEFAULT_RECLAIM_FRACTION,
    DEFAULT_ROOT_DIR_NAME, DEFAULT_SCHEMA_VERSION, DEFAULT_SIZE_HINT, DEFAULT_WORKING_SET_BYTES,
};
use crate::error::CacheError;

/// When the persistent store's index is forced to durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// After every committed download.
    #[default]
    EveryCommit,
    /// Only when [`ImageCache::flush`](super::ImageCache::flush) is called.
    Manual,
}

/// What the host platform can tell about its pixel buffers.
///
/// Resolved once when the cache is built into a [`SizeStrategy`] and a
/// [`ReuseMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The exact size of a buffer's backing allocation can be queried.
    pub allocation_size_query: bool,
    /// The per-row stride of a buffer can be queried.
    pub row_stride_query: bool,
    /// Decoders accept any reuse buffer with enough bytes, not only one of
    /// identical dimensions.
    pub byte_budget_reuse: bool,
}

impl Capabilities {
    /// Everything available.
    pub fn full() -> Self {
        Self {
            allocation_size_query: true,
            row_stride_query: true,
            byte_budget_reuse: true,
        }
    }

    /// Nothing beyond packed row bytes, exact-fit reuse only.
    pub fn minimal() -> Self {
        Self {
            allocation_size_query: false,
            row_stride_query: false,
            byte_budget_reuse: false,
        }
    }

    pub fn size_strategy(&self) -> SizeStrategy {
        if self.allocation_size_query {
            SizeStrategy::AllocationSize
        } else if self.row_stride_query {
            SizeStrategy::Stride
        } else {
            SizeStrategy::RowBytes
        }
    }

    pub fn reuse_mode(&self) -> ReuseMode {
        if self.byte_budget_reuse {
            ReuseMode::ByteBudget
        } else {
            ReuseMode::Strict
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::full()
    }
}

/// Configuration for an [`ImageCache`](super::ImageCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory of the persistent store.
    pub root_dir: PathBuf,
    /// Working-set budget of the host process in bytes.
    pub working_set_bytes: u64,
    /// Share of the working set given to the memory tier, in (0, 1].
    pub memory_fraction: f64,
    /// Storage the reclaim pool may keep parked, as a share of the memory
    /// tier's capacity, in [0, 1].
    pub reclaim_fraction: f64,
    /// Byte capacity of the persistent store.
    pub disk_capacity_bytes: u64,
    /// Schema version the persistent store is opened against. Changing it
    /// discards everything stored under another version.
    pub schema_version: u32,
    /// Run without the persistent store.
    pub memory_only: bool,
    pub capabilities: Capabilities,
    /// Pixel format requested from the decoder.
    pub decode_format: PixelFormat,
    /// Whether decoded buffers are mutable and thus eligible for reuse.
    pub mutable_buffers: bool,
    pub flush_policy: FlushPolicy,
    /// Size hint for requests that do not name one.
    pub default_size_hint: (u32, u32),
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join(DEFAULT_ROOT_DIR_NAME),
            working_set_bytes: DEFAULT_WORKING_SET_BYTES,
            memory_fraction: DEFAULT_MEMORY_FRACTION,
            reclaim_fraction: DEFAULT_RECLAIM_FRACTION,
            disk_capacity_bytes: DEFAULT_DISK_CAPACITY_BYTES,
            schema_version: DEFAULT_SCHEMA_VERSION,
            memory_only: false,
            capabilities: Capabilities::default(),
            decode_format: PixelFormat::default(),
            mutable_buffers: true,
            flush_policy: FlushPolicy::default(),
            default_size_hint: DEFAULT_SIZE_HINT,
        }
    }
}

impl CacheConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_working_set(mut self, bytes: u64) -> Self {
        self.working_set_bytes = bytes;
        self
    }

    pub fn with_memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = fraction;
        self
    }

    pub fn with_reclaim_fraction(mut self, fraction: f64) -> Self {
        self.reclaim_fraction = fraction;
        self
    }

    pub fn with_disk_capacity(mut self, bytes: u64) -> Self {
        self.disk_capacity_bytes = bytes;
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_memory_only(mut self, memory_only: bool) -> Self {
        self.memory_only = memory_only;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_decode_format(mut self, format: PixelFormat) -> Self {
        self.decode_format = format;
        self
    }

    pub fn with_mutable_buffers(mut self, mutable: bool) -> Self {
        self.mutable_buffers = mutable;
        self
    }

    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    pub fn with_default_size_hint(mut self, width: u32, height: u32) -> Self {
        self.default_size_hint = (width, height);
        self
    }

    /// Byte capacity of the memory tier.
    pub fn memory_capacity(&self) -> u64 {
        (self.working_set_bytes as f64 * self.memory_fraction) as u64
    }

    /// Bytes of evicted storage the reclaim pool may hold on to.
    pub fn reclaim_capacity(&self) -> u64 {
        (self.memory_capacity() as f64 * self.reclaim_fraction) as u64
    }

    /// Rejects configurations the cache cannot run with.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.working_set_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "working set must be greater than zero".into(),
            ));
        }
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(CacheError::InvalidConfig(format!(
                "memory fraction must be in (0, 1], got {}",
                self.memory_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.reclaim_fraction) {
            return Err(CacheError::InvalidConfig(format!(
                "reclaim fraction must be in [0, 1], got {}",
                self.reclaim_fraction
            )));
        }
        if self.memory_only {
            return Ok(());
        }
        if self.disk_capacity_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "disk capacity must be greater than zero".into(),
            ));
        }
        if self.root_dir.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfig("root directory is empty".into()));
        }
        if let Ok(meta) = std::fs::metadata(&self.root_dir) {
            if !meta.is_dir() {
                return Err(CacheError::InvalidConfig(format!(
                    "root {} is not a directory",
                    self.root_dir.display()
                )));
            }
        }
        Ok(())
    }
}
