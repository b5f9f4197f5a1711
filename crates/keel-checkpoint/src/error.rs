//! Checkpoint error types.

use thiserror::Error;

/// Errors raised by checkpoint stores.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// No checkpoint exists for the thread.
    #[error("checkpoint not found for thread '{thread_id}'")]
    NotFound {
        /// Thread that was looked up.
        thread_id: String,
    },

    /// The backend could not be reached or answered with an error.
    #[error("checkpoint backend error: {0}")]
    Backend(String),

    /// A stored record could not be encoded or decoded.
    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The write lock for a thread was not acquired in time.
    #[error("timed out acquiring checkpoint lock for thread '{thread_id}'")]
    LockTimeout {
        /// Thread whose lock was contended.
        thread_id: String,
    },

    /// A synchronous replica rejected a write.
    #[error("replication of thread '{thread_id}' failed: {message}")]
    Replication {
        /// Thread being replicated.
        thread_id: String,
        /// Secondary backend failure.
        message: String,
    },

    /// The store was configured with unusable parameters.
    #[error("invalid checkpoint configuration: {0}")]
    Config(String),

    /// The backend did not answer in time.
    #[error("checkpoint backend timed out")]
    Timeout,

    /// The store has been closed.
    #[error("checkpoint store is closed")]
    Closed,
}

impl CheckpointError {
    pub(crate) fn not_found(thread_id: &str) -> Self {
        Self::NotFound {
            thread_id: thread_id.to_string(),
        }
    }

    /// Whether this error means the thread has no checkpoint.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<redis::RedisError> for CheckpointError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for CheckpointError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Result alias for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_names_thread() {
        let err = CheckpointError::not_found("thread-7");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("thread-7"));
        assert!(!CheckpointError::Timeout.is_not_found());
    }
}
