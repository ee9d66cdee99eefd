use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error("block not found: {0}")]
    NotFound(String),

    #[error("invalid CID: {0}")]
    InvalidCid(String),

    #[error("block of {actual} bytes exceeds limit of {limit} bytes")]
    SizeLimitExceeded { actual: u64, limit: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
