/// Errors from object storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The key/value backend failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// A lock guarding the cache was poisoned by a panicking thread.
    #[error("storage lock poisoned")]
    LockPoisoned,
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
