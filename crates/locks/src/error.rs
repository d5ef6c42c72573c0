//! Error types for the lock manager.

use thiserror::Error;

/// Errors raised by lock operations
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock database could not be opened or accessed
    #[error("Lock database error: {reason}")]
    Database { reason: String },

    /// A stored record did not have the fixed 24-byte layout
    #[error("Corrupt lock record under \"{key}\": {reason}")]
    CorruptRecord { key: String, reason: String },

    /// An expired lock's holder could not be terminated
    #[error("Unable to kill expired agent process {pid} holding {key}")]
    KillFailed { pid: u32, key: String },

    /// The completion runlog could not be written
    #[error("Cannot write lock runlog {path}: {reason}")]
    Runlog { path: String, reason: String },
}

impl From<sled::Error> for LockError {
    fn from(error: sled::Error) -> Self {
        LockError::Database {
            reason: error.to_string(),
        }
    }
}

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;
