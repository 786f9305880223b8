//! Cache keys derived from source identifiers.
//!
//! Every tier is addressed by the same [`CacheKey`]. Keys are lowercase hex
//! strings so they double as file names in the persistent store, and they are
//! stable across process runs.
//!
//! With the `digest` feature (the default) keys are the SHA-256 digest of the
//! identifier's UTF-8 bytes. Without it the mapper runs degraded on a 64-bit
//! FNV-1a hash: lookups for a single identifier still work, but two distinct
//! identifiers are far more likely to collide onto one key.

use std::fmt;

#[cfg(feature = "digest")]
use sha2::{Digest, Sha256};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Identifier of one cached image across all tiers.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps an already-mapped key, e.g. one read back from the disk index.
    pub fn from_mapped(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAlgorithm {
    #[cfg(feature = "digest")]
    Sha256,
    Fnv1a,
}

/// Maps source identifiers (URLs) to [`CacheKey`]s.
///
/// The algorithm is fixed when the mapper is built; it never changes per call.
#[derive(Debug, Clone, Copy)]
pub struct KeyMapper {
    algorithm: KeyAlgorithm,
}

impl KeyMapper {
    /// Picks the strongest algorithm compiled into this build.
    pub fn new() -> Self {
        #[cfg(feature = "digest")]
        {
            Self {
                algorithm: KeyAlgorithm::Sha256,
            }
        }
        #[cfg(not(feature = "digest"))]
        {
            Self::fallback()
        }
    }

    /// A mapper running on the non-cryptographic fallback hash.
    pub fn fallback() -> Self {
        Self {
            algorithm: KeyAlgorithm::Fnv1a,
        }
    }

    /// True when keys come from the fallback hash rather than a digest.
    pub fn is_degraded(&self) -> bool {
        self.algorithm == KeyAlgorithm::Fnv1a
    }

    pub fn map(&self, source_id: &str) -> CacheKey {
        match self.algorithm {
            #[cfg(feature = "digest")]
            KeyAlgorithm::Sha256 => {
                let digest = Sha256::digest(source_id.as_bytes());
                CacheKey(hex_encode(&digest))
            }
            KeyAlgorithm::Fnv1a => CacheKey(format!("{:016x}", fnv1a(source_id.as_bytes()))),
        }
    }
}

impl Default for KeyMapper {
    fn default() -> Self {
        Self::new()
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

#[cfg(feature = "digest")]
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
        s
    })
}
