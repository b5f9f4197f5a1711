//! The error taxonomy handlers and middlewares return.
//!
//! [`KeelError`] names the failure kinds the chassis itself produces. Each
//! variant maps to a registered [`Errno`], which fixes both the numeric code
//! and the HTTP status. Anything else can be expressed with
//! [`KeelError::Coded`] and an application-registered [`Errno`].
//!
//! In production (`APP_ENV` is `production` or `prod`) the public message of
//! internal failures is reduced to the registered message so that panic
//! payloads and source chains never reach clients.

use crate::errno::{builtin, Errno};
use crate::validate::{join_field_errors, FieldError};
use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`KeelError`].
pub type KeelResult<T> = Result<T, KeelError>;

/// Boxed error used as a source.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by handlers, middlewares and binding.
#[derive(Error, Debug)]
pub enum KeelError {
    /// Request could not be parsed.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong.
        message: String,
    },

    /// Request parsed but failed field validation.
    #[error("validation failed: {}", join_field_errors(.fields))]
    ValidationFailed {
        /// Every failing field.
        fields: Vec<FieldError>,
    },

    /// Credentials missing or rejected.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Reason.
        message: String,
    },

    /// Token failed verification.
    #[error("invalid token: {message}")]
    TokenInvalid {
        /// Reason.
        message: String,
    },

    /// Token is past its expiry.
    #[error("token expired")]
    TokenExpired,

    /// Caller is authenticated but not allowed.
    #[error("no permission: {message}")]
    NoPermission {
        /// Reason.
        message: String,
    },

    /// No route matched.
    #[error("route not found: {method} {path}")]
    RouteNotFound {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// A named resource does not exist.
    #[error("resource not found: {resource}")]
    ResourceNotFound {
        /// Resource description.
        resource: String,
    },

    /// State conflict.
    #[error("conflict: {message}")]
    Conflict {
        /// Reason.
        message: String,
    },

    /// Rate limit denied the request.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Deadline elapsed before the handler finished.
    ///
    /// `client_induced` selects 408 instead of 504.
    #[error("request timed out after {timeout:?}")]
    RequestTimeout {
        /// Configured deadline.
        timeout: Duration,
        /// True when the client caused the timeout.
        client_induced: bool,
    },

    /// Body exceeded the configured limit.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Limit in bytes.
        limit: u64,
    },

    /// A downstream dependency could not be reached.
    #[error("network unavailable: {message}")]
    NetworkUnavailable {
        /// Reason.
        message: String,
    },

    /// The service refuses work (for example an open circuit breaker).
    #[error("service unavailable: {message}")]
    ServiceUnavailable {
        /// Reason.
        message: String,
    },

    /// A panic was recovered.
    #[error("panic: {message}")]
    Panic {
        /// Panic payload.
        message: String,
    },

    /// Internal failure with optional source.
    #[error("internal error: {message}")]
    Internal {
        /// Description.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<BoxError>,
    },

    /// Any registered code, with an optional message override.
    #[error("{}", coded_message(.errno, .message))]
    Coded {
        /// Registered code.
        errno: Errno,
        /// Overrides the registered message.
        message: Option<String>,
    },
}

fn coded_message<'a>(errno: &Errno, message: &'a Option<String>) -> &'a str {
    match message {
        Some(message) => message.as_str(),
        None => errno.message_en(),
    }
}

impl KeelError {
    /// Creates an [`KeelError::InvalidRequest`].
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a [`KeelError::ValidationFailed`].
    pub fn validation(fields: Vec<FieldError>) -> Self {
        Self::ValidationFailed { fields }
    }

    /// Creates an [`KeelError::Unauthorized`].
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates a [`KeelError::NoPermission`].
    pub fn no_permission(message: impl Into<String>) -> Self {
        Self::NoPermission {
            message: message.into(),
        }
    }

    /// Creates a [`KeelError::ResourceNotFound`].
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            resource: resource.into(),
        }
    }

    /// Creates a [`KeelError::ServiceUnavailable`].
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    /// Creates an [`KeelError::Internal`] without a source.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an [`KeelError::Internal`] wrapping `source`.
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wraps a registered code.
    pub fn coded(errno: Errno) -> Self {
        Self::Coded {
            errno,
            message: None,
        }
    }

    /// Wraps a registered code with a custom message.
    pub fn coded_with_message(errno: Errno, message: impl Into<String>) -> Self {
        Self::Coded {
            errno,
            message: Some(message.into()),
        }
    }

    /// Registered code backing this error.
    pub fn errno(&self) -> Errno {
        match self {
            Self::InvalidRequest { .. } => builtin::INVALID_FORMAT,
            Self::ValidationFailed { .. } => builtin::VALIDATION_FAILED,
            Self::Unauthorized { .. } => builtin::UNAUTHORIZED,
            Self::TokenInvalid { .. } => builtin::INVALID_TOKEN,
            Self::TokenExpired => builtin::TOKEN_EXPIRED,
            Self::NoPermission { .. } => builtin::NO_PERMISSION,
            Self::RouteNotFound { .. } => builtin::ROUTE_NOT_FOUND,
            Self::ResourceNotFound { .. } => builtin::NOT_FOUND,
            Self::Conflict { .. } => builtin::CONFLICT,
            Self::RateLimitExceeded => builtin::RATE_LIMIT_EXCEEDED,
            Self::RequestTimeout {
                client_induced: true,
                ..
            } => builtin::REQUEST_TIMEOUT,
            Self::RequestTimeout { .. } => builtin::GATEWAY_TIMEOUT,
            Self::PayloadTooLarge { .. } => builtin::REQUEST_TOO_LARGE,
            Self::NetworkUnavailable { .. } => builtin::NETWORK,
            Self::ServiceUnavailable { .. } => builtin::SERVICE_UNAVAILABLE,
            Self::Panic { .. } => builtin::PANIC,
            Self::Internal { .. } => builtin::INTERNAL,
            Self::Coded { errno, .. } => *errno,
        }
    }

    /// Numeric code.
    pub fn code(&self) -> u32 {
        self.errno().code()
    }

    /// HTTP status for the response.
    pub fn status_code(&self) -> StatusCode {
        self.errno().http_status()
    }

    /// True for failures whose details must stay server-side.
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Panic { .. } | Self::Internal { .. })
    }

    /// Message shown to clients.
    ///
    /// Internal failures in production and any non-English language use the
    /// registered message; otherwise the full error text is returned.
    pub fn public_message(&self, lang: &str, production: bool) -> String {
        let errno = self.errno();
        if (production && self.is_internal()) || errno.message(lang) != errno.message_en() {
            return errno.message(lang).to_string();
        }
        self.to_string()
    }

    /// Structured details carried in the envelope `data` field.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::ValidationFailed { fields } => serde_json::to_value(fields).ok(),
            _ => None,
        }
    }
}

impl From<FieldError> for KeelError {
    fn from(field: FieldError) -> Self {
        Self::ValidationFailed {
            fields: vec![field],
        }
    }
}

/// True when `APP_ENV` names a production deployment.
pub fn is_production() -> bool {
    std::env::var("APP_ENV")
        .map(|env| {
            let env = env.trim().to_ascii_lowercase();
            env == "production" || env == "prod"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            KeelError::invalid_request("bad json").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            KeelError::unauthorized("missing").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            KeelError::no_permission("nope").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            KeelError::RateLimitExceeded.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            KeelError::PayloadTooLarge { limit: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            KeelError::unavailable("open").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_timeout_status_depends_on_cause() {
        let server = KeelError::RequestTimeout {
            timeout: Duration::from_millis(50),
            client_induced: false,
        };
        let client = KeelError::RequestTimeout {
            timeout: Duration::from_millis(50),
            client_induced: true,
        };
        assert_eq!(server.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(client.status_code(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn test_public_message_hides_panic_in_production() {
        let err = KeelError::Panic {
            message: "boom".to_string(),
        };
        assert_eq!(err.public_message("en", false), "panic: boom");
        assert_eq!(err.public_message("en", true), "Service panic");
        assert_eq!(err.public_message("zh", false), "服务崩溃");
    }

    #[test]
    fn test_validation_details() {
        let err = KeelError::validation(vec![
            FieldError::new("name", "required"),
            FieldError::new("age", "must be positive"),
        ]);
        assert_eq!(
            err.to_string(),
            "validation failed: name: required; age: must be positive"
        );
        let details = err.details().unwrap();
        assert_eq!(details[0]["field"], "name");
        assert_eq!(details[1]["message"], "must be positive");
    }

    #[test]
    fn test_coded_message_override() {
        let err = KeelError::coded(builtin::QUOTA_EXCEEDED);
        assert_eq!(err.to_string(), "Quota exceeded");
        let err = KeelError::coded_with_message(builtin::QUOTA_EXCEEDED, "daily quota used");
        assert_eq!(err.to_string(), "daily quota used");
        assert_eq!(err.code(), builtin::QUOTA_EXCEEDED.code());
    }

    #[test]
    fn test_internal_keeps_source() {
        use std::error::Error as _;
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = KeelError::internal_with_source("write failed", io);
        assert!(err.source().is_some());
        assert!(err.is_internal());
    }
}
