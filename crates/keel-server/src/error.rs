//! Server error types.

use keel_core::RouteError;
use thiserror::Error;

/// Errors raised while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured address does not parse.
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidAddress {
        /// Address as configured.
        addr: String,
        /// Parser message.
        reason: String,
    },

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was tried.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Any other listener I/O failure.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A route could not be registered.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// The accept loop task ended abnormally.
    #[error("server task failed: {0}")]
    Task(String),
}

/// Result alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
