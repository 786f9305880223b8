use std::sync::Arc;

use thiserror::Error;

use crate::decode::DecodeError;
use crate::fetch::DownloadError;
use crate::storage::StorageError;

/// Failure delivered to a request's result callback.
///
/// One outcome is shared by every caller waiting on the same key, so the
/// error is cheaply cloneable and sources are kept behind `Arc`.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("network failure: {0}")]
    Network(Arc<DownloadError>),

    #[error("decode failure: {0}")]
    Decode(Arc<DecodeError>),

    #[error("disk failure: {0}")]
    DiskIo(Arc<StorageError>),

    /// Another writer holds the record and nothing is in flight to wait on.
    #[error("record {0} is being written by another writer")]
    WriterBusy(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The task resolving the request went away without an outcome.
    #[error("request cancelled before completion")]
    Cancelled,
}

impl From<DownloadError> for CacheError {
    fn from(err: DownloadError) -> Self {
        CacheError::Network(Arc::new(err))
    }
}

impl From<DecodeError> for CacheError {
    fn from(err: DecodeError) -> Self {
        CacheError::Decode(Arc::new(err))
    }
}

impl From<StorageError> for CacheError {
    fn from(err: StorageError) -> Self {
        CacheError::DiskIo(Arc::new(err))
    }
}

impl CacheError {
    pub fn is_network(&self) -> bool {
        matches!(self, CacheError::Network(_))
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, CacheError::Decode(_))
    }
}
