use thiserror::Error;

/// Errors from fetching a source from its origin.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("origin returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("invalid source url: {0}")]
    InvalidUrl(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
