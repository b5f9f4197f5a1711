//! Recovery, request id and logger records.

use crate::matcher::PathMatcher;
use keel_core::{FieldError, Validate};
use serde::{Deserialize, Serialize};

/// Default correlation header.
pub const DEFAULT_REQUEST_ID_HEADER: &str = "X-Request-ID";

pub(crate) fn probe_paths() -> Vec<String> {
    ["/health", "/ready", "/live", "/metrics"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Panic recovery settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RecoveryOptions {
    /// Include the stack trace in non-production error messages.
    pub enable_stack_trace: bool,
}

impl Validate for RecoveryOptions {
    fn validate(&self) -> Vec<FieldError> {
        Vec::new()
    }
}

impl RecoveryOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(self) -> Self {
        self
    }
}

/// Id generation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdGenerator {
    /// 16 random bytes as 32 lowercase hex characters.
    #[default]
    RandomHex,
    /// 26-character time-ordered ULID.
    Ulid,
}

/// Request id settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RequestIdOptions {
    /// Header read from the request and written to the response.
    pub header: String,
    /// Generator used when the request carries no id.
    pub generator: IdGenerator,
}

impl Default for RequestIdOptions {
    fn default() -> Self {
        Self {
            header: DEFAULT_REQUEST_ID_HEADER.to_string(),
            generator: IdGenerator::default(),
        }
    }
}

impl Validate for RequestIdOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if !self.header.is_empty() && http_header_name_invalid(&self.header) {
            errors.push(FieldError::new("header", "must be a valid HTTP header name"));
        }
        errors
    }
}

impl RequestIdOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        if self.header.is_empty() {
            self.header = DEFAULT_REQUEST_ID_HEADER.to_string();
        }
        self
    }
}

fn http_header_name_invalid(name: &str) -> bool {
    !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

/// Access log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggerOptions {
    /// Paths that are not logged.
    #[serde(flatten)]
    pub skip: PathMatcher,
    /// Emit structured events instead of a formatted line.
    pub use_structured_logger: bool,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            skip: PathMatcher::paths(probe_paths()),
            use_structured_logger: true,
        }
    }
}

impl Validate for LoggerOptions {
    fn validate(&self) -> Vec<FieldError> {
        Vec::new()
    }
}

impl LoggerOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(self) -> Self {
        self
    }
}
