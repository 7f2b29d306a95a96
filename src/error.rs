//! Error taxonomy shared by the queue, the scan cache and the processor

use rusqlite::ErrorCode;
use thiserror::Error;

/// Failures talking to the shared job/cache store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lock contention or busy timeout; the caller may retry
    #[error("store temporarily unavailable: {0}")]
    Transient(#[source] rusqlite::Error),

    /// A uniqueness constraint rejected a write (concurrent insert of the same key)
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("database error: {0}")]
    Database(#[source] rusqlite::Error),

    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, StoreError::Integrity(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Transient(err)
            }
            Some(ErrorCode::ConstraintViolation) => StoreError::Integrity(err.to_string()),
            _ => StoreError::Database(err),
        }
    }
}

/// Failure reported by the external content scanner
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    #[error("scanner failed: {0}")]
    Failed(String),

    #[error("scanner timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Failure of a single job inside the processing pipeline
///
/// Every variant is fatal to the job (it goes back to the retry policy) but
/// never to the worker loop.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to load payload: {0:#}")]
    Load(anyhow::Error),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("delivery failed: {0:#}")]
    Deliver(anyhow::Error),

    #[error("queue update failed: {0}")]
    Queue(#[from] StoreError),

    #[error("job processing panicked: {0}")]
    Panicked(String),
}
