use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while locking, transferring or reconciling databases.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The transfer tool or object store reported a failure.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("{db} is already locked by {owner}")]
    AlreadyLocked { db: String, owner: String },

    #[error("{db} is locked by {owner}, refusing to unlock")]
    NotOwner { db: String, owner: String },

    #[error("{db} is being uploaded by {owner}")]
    UploadInProgress { db: String, owner: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// True when the operation was aborted through its cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// True for transient failures worth another attempt.
    ///
    /// Ownership conflicts and cancellation are terminal: retrying them
    /// cannot change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Io(_) | SyncError::Remote(_))
    }

    /// True when the error only reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
