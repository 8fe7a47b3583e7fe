// volchain-storage/src/lib.rs

//! File-backed Persistence
//!
//! This crate provides the on-disk store behind the block producer:
//! - Append-only JSONL mempool
//! - Block index plus one JSON body per height
//! - Atomically replaced snapshot
//! - Legacy per-transaction event log
//! - Newest-first paging over blocks and events

pub mod atomic;
pub mod db;

pub use atomic::write_atomic;
pub use db::{FileStore, Page, MAX_PAGE_LIMIT};

use volchain_core::LedgerError;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<StorageError> for LedgerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::SerializationError(e) => LedgerError::Serialization(e.to_string()),
            StorageError::Corruption(msg) => LedgerError::Integrity(msg),
            other => LedgerError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: LedgerError = StorageError::Corruption("blocks.log line 3".into()).into();
        assert_eq!(err.code(), "integrity_error");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: LedgerError = StorageError::from(io).into();
        assert_eq!(err.code(), "storage_error");
    }
}
