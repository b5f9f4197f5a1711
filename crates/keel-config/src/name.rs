//! The closed set of middleware names.
//!
//! Options, factories and the registrar all key on [`MiddlewareName`], so a
//! typo in one place cannot silently disable a middleware in another.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A recognized middleware or operational endpoint name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MiddlewareName {
    /// Panic recovery.
    Recovery,
    /// Request correlation id.
    RequestId,
    /// Access logging.
    Logger,
    /// Cross-origin resource sharing.
    Cors,
    /// Request deadline.
    Timeout,
    /// Request body cap.
    BodyLimit,
    /// Request metrics and scrape endpoint.
    Metrics,
    /// Response compression.
    Compression,
    /// Security response headers.
    SecurityHeaders,
    /// Circuit breaker.
    CircuitBreaker,
    /// Rate limiting.
    RateLimit,
    /// Health endpoints.
    Health,
    /// Authentication.
    Auth,
    /// Authorization.
    Authz,
    /// Version endpoint.
    Version,
    /// Profiling endpoints.
    Pprof,
    /// Distributed tracing.
    Tracing,
}

impl MiddlewareName {
    /// Every recognized name.
    pub const ALL: [Self; 17] = [
        Self::Recovery,
        Self::RequestId,
        Self::Logger,
        Self::Cors,
        Self::Timeout,
        Self::BodyLimit,
        Self::Metrics,
        Self::Compression,
        Self::SecurityHeaders,
        Self::CircuitBreaker,
        Self::RateLimit,
        Self::Health,
        Self::Auth,
        Self::Authz,
        Self::Version,
        Self::Pprof,
        Self::Tracing,
    ];

    /// Canonical kebab-case name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Recovery => "recovery",
            Self::RequestId => "request-id",
            Self::Logger => "logger",
            Self::Cors => "cors",
            Self::Timeout => "timeout",
            Self::BodyLimit => "body-limit",
            Self::Metrics => "metrics",
            Self::Compression => "compression",
            Self::SecurityHeaders => "security-headers",
            Self::CircuitBreaker => "circuit-breaker",
            Self::RateLimit => "rate-limit",
            Self::Health => "health",
            Self::Auth => "auth",
            Self::Authz => "authz",
            Self::Version => "version",
            Self::Pprof => "pprof",
            Self::Tracing => "tracing",
        }
    }

    /// True for names that install routes rather than wrap handlers.
    pub const fn is_route(self) -> bool {
        matches!(self, Self::Health | Self::Version | Self::Pprof)
    }
}

/// Enabled by default.
pub const DEFAULT_ENABLED: [MiddlewareName; 5] = [
    MiddlewareName::Recovery,
    MiddlewareName::RequestId,
    MiddlewareName::Logger,
    MiddlewareName::Health,
    MiddlewareName::Metrics,
];

impl fmt::Display for MiddlewareName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for strings outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMiddleware(pub String);

impl fmt::Display for UnknownMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid middleware name: {:?}, valid names: ", self.0)?;
        let names: Vec<_> = MiddlewareName::ALL.iter().map(|n| n.as_str()).collect();
        f.write_str(&names.join(", "))
    }
}

impl std::error::Error for UnknownMiddleware {}

impl FromStr for MiddlewareName {
    type Err = UnknownMiddleware;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownMiddleware(s.to_string()))
    }
}
