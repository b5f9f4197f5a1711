//! Configuration error types.

use keel_core::{join_field_errors, FieldError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// Failed to read configuration file.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML configuration: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error.
    #[error("failed to parse JSON configuration: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Unsupported file format.
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    /// Environment variable parsing error.
    #[error("failed to parse environment variable {var}: {reason}")]
    EnvParseError {
        /// The environment variable name.
        var: String,
        /// Explanation of the parsing error.
        reason: String,
    },

    /// Loaded options failed validation.
    #[error("configuration validation failed: {}", join_field_errors(.0))]
    Validation(Vec<FieldError>),

    /// A reloaded file was rejected.
    #[error(transparent)]
    Reload(#[from] ReloadError),

    /// File watcher could not be created or attached.
    #[error("file watcher error: {message}")]
    Watch {
        /// Description of the failure.
        message: String,
    },
}

impl ConfigError {
    /// Create a new file not found error.
    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Create a new read error.
    pub fn read_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadError {
            path: path.into(),
            source,
        }
    }

    /// Create a new environment variable parse error.
    pub fn env_parse_error(var: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EnvParseError {
            var: var.into(),
            reason: reason.into(),
        }
    }

    /// Create a new watcher error.
    pub fn watch(message: impl Into<String>) -> Self {
        Self::Watch {
            message: message.into(),
        }
    }
}

/// Errors returned by a rejected hot-reload.
///
/// A rejected reload leaves the running configuration untouched.
#[derive(Error, Debug)]
pub enum ReloadError {
    /// The submitted value does not have the shape of the options tree.
    #[error("invalid config type: expected {expected}: {reason}")]
    TypeMismatch {
        /// Expected type.
        expected: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// One or more enabled records failed validation.
    #[error("invalid middleware configuration: {}", join_field_errors(.0))]
    Invalid(Vec<FieldError>),
}

impl ReloadError {
    /// Field errors, if this is a validation failure.
    pub fn fields(&self) -> &[FieldError] {
        match self {
            Self::Invalid(fields) => fields,
            Self::TypeMismatch { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_not_found_error() {
        let err = ConfigError::file_not_found("/path/to/keel.toml");
        assert!(err.to_string().contains("/path/to/keel.toml"));
    }

    #[test]
    fn test_env_parse_error() {
        let err = ConfigError::env_parse_error("KEEL__TIMEOUT__TIMEOUT", "bad duration");
        assert!(err.to_string().contains("KEEL__TIMEOUT__TIMEOUT"));
        assert!(err.to_string().contains("bad duration"));
    }

    #[test]
    fn test_reload_error_names_every_field() {
        let err = ReloadError::Invalid(vec![
            FieldError::new("timeout.timeout", "must not be negative"),
            FieldError::new("cors.allow-origins", "must not be empty"),
        ]);
        let text = err.to_string();
        assert!(text.contains("timeout.timeout"));
        assert!(text.contains("cors.allow-origins"));
        assert_eq!(err.fields().len(), 2);
    }
}
