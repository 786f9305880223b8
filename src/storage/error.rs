use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid record key: {0:?}")]
    InvalidKey(String),

    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    #[error("record of {size} bytes exceeds store capacity of {max} bytes")]
    TooLarge { size: u64, max: u64 },
}
