//! Error types for registration, construction and limiter stores.

use keel_core::{FieldError, RouteError};
use thiserror::Error;

/// Errors raised while collecting middlewares.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrarError {
    /// `register` was called without a handler.
    #[error("middleware '{name}' registered without a handler")]
    MissingHandler {
        /// Name passed to `register`.
        name: String,
    },
}

/// Errors raised by middleware factories and route registrars.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// The configuration record has the wrong type for this factory.
    #[error("invalid config for '{name}': expected {expected}, got {actual}")]
    InvalidConfig {
        /// Factory name.
        name: String,
        /// Record type the factory accepts.
        expected: &'static str,
        /// Record type that was passed.
        actual: &'static str,
    },

    /// No factory is registered under this name.
    #[error("no factory registered for '{0}'")]
    NotRegistered(String),

    /// The middleware needs runtime objects the options tree cannot supply.
    #[error("middleware '{0}' needs runtime dependencies; build it with its stage constructor")]
    NeedsRuntime(String),

    /// The record failed validation.
    #[error("invalid '{name}' configuration: {message}")]
    Invalid {
        /// Factory name.
        name: String,
        /// Joined field errors.
        message: String,
        /// Field-level detail.
        fields: Vec<FieldError>,
    },

    /// A side route could not be registered.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// A backing store could not be created.
    #[error("middleware '{name}' backend: {source}")]
    Backend {
        /// Factory name.
        name: String,
        /// Underlying failure.
        #[source]
        source: LimiterError,
    },
}

impl FactoryError {
    pub(crate) fn invalid(name: &str, fields: Vec<FieldError>) -> Self {
        Self::Invalid {
            name: name.to_string(),
            message: keel_core::join_field_errors(&fields),
            fields,
        }
    }
}

/// Errors raised by rate-limit stores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    /// The backend could not be reached or answered with an error.
    #[error("limiter backend error: {0}")]
    Backend(String),

    /// The store was configured with unusable parameters.
    #[error("invalid limiter configuration: {0}")]
    Config(String),

    /// The backend did not answer in time.
    #[error("limiter backend timed out")]
    Timeout,
}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for LimiterError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_joins_fields() {
        let err = FactoryError::invalid(
            "cors",
            vec![
                FieldError::new("cors.allow_origins", "must not be empty"),
                FieldError::new("cors.max_age", "must not be negative"),
            ],
        );
        let text = err.to_string();
        assert!(text.contains("cors.allow_origins"));
        assert!(text.contains("cors.max_age"));
    }

    #[test]
    fn test_invalid_config_names_both_types() {
        let err = FactoryError::InvalidConfig {
            name: "timeout".into(),
            expected: "TimeoutOptions",
            actual: "CorsOptions",
        };
        let text = err.to_string();
        assert!(text.contains("TimeoutOptions") && text.contains("CorsOptions"));
    }
}
