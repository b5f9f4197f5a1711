//! Structured validation results.
//!
//! Both request binding ([`Context::bind_valid`](crate::Context::bind_valid)) and
//! option records in `keel-config` report problems as a list of [`FieldError`]s,
//! so a single failure response can name every offending field at once.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path of the offending field (e.g. `timeout.timeout`).
    pub field: String,
    /// Human-readable reason.
    pub message: String,
}

impl FieldError {
    /// Creates a new field error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Prefixes the field path with `prefix.`.
    pub fn nested(mut self, prefix: &str) -> Self {
        self.field = format!("{prefix}.{}", self.field);
        self
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Types that can check their own invariants.
///
/// Returning an empty list means the value is valid.
pub trait Validate {
    /// Returns every field that fails validation.
    fn validate(&self) -> Vec<FieldError>;

    /// Shorthand for `self.validate().is_empty()`.
    fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

/// Joins field errors into a single `field: message; field: message` line.
pub fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
