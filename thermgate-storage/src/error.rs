//! Storage error types.

use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("transaction rolled back by SQLite: {0}")]
    TransactionAborted(rusqlite::Error),

    #[error("database not connected")]
    NotConnected,

    #[error("database unreachable after {attempts} attempts")]
    RetryLimitReached { attempts: u32 },
}

impl StorageError {
    /// Returns whether the gateway can keep running after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::RetryLimitReached { .. })
    }
}
