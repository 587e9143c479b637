//! Error types for the tsidx index core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum mismatch, unexpected tag bytes, truncated non-tail data or
    /// an unknown page type. Fatal for the operation that hit it.
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    /// A copy-on-write tree commit lost the version race. Internal;
    /// compaction retries it with a fresh snapshot.
    #[error("tree transaction aborted")]
    TransactionAborted,

    /// A label set already resolves to more than one TSID.
    #[error("series is not unique")]
    NotUnique,

    /// A record or item is larger than its container can ever hold.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("invalid regex matcher: {0}")]
    Regex(#[from] regex::Error),
}

impl IndexError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        IndexError::CorruptIndex(msg.into())
    }
}
