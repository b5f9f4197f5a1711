//! Chassis assembly errors.

use keel_config::{ConfigError, MiddlewareName};
use keel_core::{join_field_errors, FieldError};
use keel_middleware::{FactoryError, RegistrarError};
use keel_server::ServerError;
use thiserror::Error;

/// Errors raised while assembling or starting a service.
#[derive(Debug, Error)]
pub enum ChassisError {
    /// The options tree failed validation.
    #[error("invalid middleware configuration: {}", join_field_errors(.0))]
    Invalid(Vec<FieldError>),

    /// A middleware or endpoint could not be built.
    #[error("failed to build '{name}': {source}")]
    Factory {
        /// Middleware or endpoint name.
        name: MiddlewareName,
        /// Factory failure.
        #[source]
        source: FactoryError,
    },

    /// A middleware could not be registered.
    #[error(transparent)]
    Registrar(#[from] RegistrarError),

    /// Configuration could not be loaded or watched.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The server could not start.
    #[error(transparent)]
    Server(#[from] ServerError),
}

impl ChassisError {
    pub(crate) fn factory(name: MiddlewareName, source: FactoryError) -> Self {
        Self::Factory { name, source }
    }
}

/// Result alias for chassis operations.
pub type ChassisResult<T> = Result<T, ChassisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_error_names_middleware() {
        let err = ChassisError::factory(
            MiddlewareName::Auth,
            FactoryError::NeedsRuntime("auth".into()),
        );
        let text = err.to_string();
        assert!(text.starts_with("failed to build 'auth'"), "{text}");
    }
}
