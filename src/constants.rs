//! Default sizes, limits and tuning parameters.
//!
//! These values mirror what mobile image loaders typically ship with: a
//! memory tier sized at an eighth of the process working set and a small
//! disk tier for downloaded source images.

use std::time::Duration;

// ============================================================================
// Memory tier
// ============================================================================

/// Working-set budget assumed when the host does not report one (256 MiB).
pub const DEFAULT_WORKING_SET_BYTES: u64 = 256 * 1024 * 1024;

/// Share of the working set handed to the memory tier.
pub const DEFAULT_MEMORY_FRACTION: f64 = 1.0 / 8.0;

/// Parked storage the reclaim pool may hold, as a share of the memory tier.
pub const DEFAULT_RECLAIM_FRACTION: f64 = 0.5;

// ============================================================================
// Disk tier
// ============================================================================

/// Default byte capacity of the persistent store (10 MiB).
pub const DEFAULT_DISK_CAPACITY_BYTES: u64 = 10 * 1024 * 1024;

/// Default schema version the persistent store is opened against.
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// Directory name used under the platform cache dir when no root is given.
pub const DEFAULT_ROOT_DIR_NAME: &str = "pixtier";

/// Name of the index file inside the store root.
pub const JOURNAL_FILE: &str = "journal";

/// Temporary name used while the index is being rewritten.
pub const JOURNAL_FILE_TMP: &str = "journal.tmp";

/// First header line of the index file.
pub const JOURNAL_MAGIC: &str = "pixtier.journal";

/// On-disk format version of the index file itself.
pub const JOURNAL_FORMAT_VERSION: &str = "1";

/// Each record stores a single value stream.
pub const JOURNAL_VALUE_COUNT: u32 = 1;

/// Redundant index lines tolerated before the index is compacted.
pub const JOURNAL_REBUILD_THRESHOLD: usize = 2000;

/// Suffix of staged (uncommitted) record files.
pub const STAGED_SUFFIX: &str = ".tmp";

/// Longest accepted record key.
pub const MAX_KEY_LEN: usize = 120;

// ============================================================================
// Origin fetch
// ============================================================================

/// Intermediate buffer between the origin stream and the staged record (8 KiB).
pub const DOWNLOAD_BUFFER_SIZE: usize = 8 * 1024;

/// Timeout for establishing the origin connection.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for each read from the origin.
pub const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// User agent sent to origins.
pub const USER_AGENT: &str = concat!("pixtier/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Decode defaults
// ============================================================================

/// Size hint used by `load` when no display target supplies one.
pub const DEFAULT_SIZE_HINT: (u32, u32) = (512, 512);
