//! Typed option records, one per middleware.
//!
//! [`Options`] is the root of the configuration tree. The `enabled` list
//! selects which records are active; only active records are validated, so a
//! half-filled section for a disabled middleware never blocks startup.
//!
//! ```
//! use keel_config::{MiddlewareName, Options};
//!
//! let opts = Options::default().without(MiddlewareName::Metrics);
//! assert!(opts.is_enabled(MiddlewareName::Recovery));
//! assert!(!opts.is_enabled(MiddlewareName::Metrics));
//! ```

mod request;
mod observability;
mod security;
mod traffic;

pub use request::{
    IdGenerator, LoggerOptions, RecoveryOptions, RequestIdOptions, DEFAULT_REQUEST_ID_HEADER,
};
pub use observability::{
    HealthOptions, MetricsOptions, PprofOptions, TracingOptions, VersionOptions,
};
pub use security::{
    parse_token_lookup, AuthOptions, AuthzOptions, CorsOptions, SecurityHeadersOptions,
    TokenLookup, TokenSource, DEFAULT_HSTS_MAX_AGE,
};
pub use traffic::{
    parse_network, BodyLimitOptions, CircuitBreakerOptions, CompressionOptions, LimiterBackend,
    RateLimitOptions, TimeoutOptions, DEFAULT_BODY_LIMIT, DEFAULT_RATE_WINDOW, DEFAULT_TIMEOUT,
};

use crate::name::{MiddlewareName, UnknownMiddleware, DEFAULT_ENABLED};
use keel_core::{FieldError, Validate};
use serde::{Deserialize, Serialize};

/// Root of the middleware configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Options {
    /// Names of the active middlewares and endpoints.
    pub enabled: Vec<String>,
    /// Panic recovery.
    pub recovery: RecoveryOptions,
    /// Request correlation id.
    pub request_id: RequestIdOptions,
    /// Access logging.
    pub logger: LoggerOptions,
    /// Cross-origin resource sharing.
    pub cors: CorsOptions,
    /// Request deadline.
    pub timeout: TimeoutOptions,
    /// Request body cap.
    pub body_limit: BodyLimitOptions,
    /// Request metrics.
    pub metrics: MetricsOptions,
    /// Response compression.
    pub compression: CompressionOptions,
    /// Security headers.
    pub security_headers: SecurityHeadersOptions,
    /// Circuit breaker.
    pub circuit_breaker: CircuitBreakerOptions,
    /// Rate limiting.
    pub rate_limit: RateLimitOptions,
    /// Health endpoints.
    pub health: HealthOptions,
    /// Authentication.
    pub auth: AuthOptions,
    /// Authorization.
    pub authz: AuthzOptions,
    /// Version endpoint.
    pub version: VersionOptions,
    /// Profiling endpoints.
    pub pprof: PprofOptions,
    /// Distributed tracing.
    pub tracing: TracingOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_ENABLED.iter().map(|n| n.as_str().to_string()).collect(),
            recovery: RecoveryOptions::default(),
            request_id: RequestIdOptions::default(),
            logger: LoggerOptions::default(),
            cors: CorsOptions::default(),
            timeout: TimeoutOptions::default(),
            body_limit: BodyLimitOptions::default(),
            metrics: MetricsOptions::default(),
            compression: CompressionOptions::default(),
            security_headers: SecurityHeadersOptions::default(),
            circuit_breaker: CircuitBreakerOptions::default(),
            rate_limit: RateLimitOptions::default(),
            health: HealthOptions::default(),
            auth: AuthOptions::default(),
            authz: AuthzOptions::default(),
            version: VersionOptions::default(),
            pprof: PprofOptions::default(),
            tracing: TracingOptions::default(),
        }
    }
}

macro_rules! with_record {
    ($($method:ident => $field:ident: $ty:ty, $name:ident;)*) => {
        $(
            #[doc = concat!("Enables `", stringify!($field), "` with the given record.")]
            #[must_use]
            pub fn $method(mut self, record: $ty) -> Self {
                self.$field = record;
                self.enable(MiddlewareName::$name);
                self
            }
        )*
    };
}

impl Options {
    /// Default options with nothing enabled.
    pub fn empty() -> Self {
        Self {
            enabled: Vec::new(),
            ..Self::default()
        }
    }

    /// True when `name` is listed in `enabled`.
    pub fn is_enabled(&self, name: MiddlewareName) -> bool {
        self.enabled.iter().any(|n| n == name.as_str())
    }

    /// Adds `name` to `enabled` if missing.
    pub fn enable(&mut self, name: MiddlewareName) {
        if !self.is_enabled(name) {
            self.enabled.push(name.as_str().to_string());
        }
    }

    /// Removes `name` from `enabled`.
    pub fn disable(&mut self, name: MiddlewareName) {
        self.enabled.retain(|n| n != name.as_str());
    }

    /// Recognized enabled names in listing order, without duplicates.
    pub fn enabled_names(&self) -> Vec<MiddlewareName> {
        let mut names = Vec::with_capacity(self.enabled.len());
        for name in self.enabled.iter().filter_map(|n| n.parse().ok()) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Entries of `enabled` that are not recognized names.
    pub fn unknown_names(&self) -> Vec<UnknownMiddleware> {
        self.enabled
            .iter()
            .filter_map(|n| n.parse::<MiddlewareName>().err())
            .collect()
    }

    /// Builder form of [`disable`](Self::disable).
    #[must_use]
    pub fn without(mut self, name: MiddlewareName) -> Self {
        self.disable(name);
        self
    }

    /// Builder form of [`enable`](Self::enable).
    #[must_use]
    pub fn with(mut self, name: MiddlewareName) -> Self {
        self.enable(name);
        self
    }

    with_record! {
        with_recovery => recovery: RecoveryOptions, Recovery;
        with_request_id => request_id: RequestIdOptions, RequestId;
        with_logger => logger: LoggerOptions, Logger;
        with_cors => cors: CorsOptions, Cors;
        with_timeout => timeout: TimeoutOptions, Timeout;
        with_body_limit => body_limit: BodyLimitOptions, BodyLimit;
        with_metrics => metrics: MetricsOptions, Metrics;
        with_compression => compression: CompressionOptions, Compression;
        with_security_headers => security_headers: SecurityHeadersOptions, SecurityHeaders;
        with_circuit_breaker => circuit_breaker: CircuitBreakerOptions, CircuitBreaker;
        with_rate_limit => rate_limit: RateLimitOptions, RateLimit;
        with_health => health: HealthOptions, Health;
        with_auth => auth: AuthOptions, Auth;
        with_authz => authz: AuthzOptions, Authz;
        with_version => version: VersionOptions, Version;
        with_pprof => pprof: PprofOptions, Pprof;
        with_tracing => tracing: TracingOptions, Tracing;
    }

    /// Returns a copy with every record's defaults filled in.
    #[must_use]
    pub fn complete(self) -> Self {
        Self {
            enabled: self.enabled,
            recovery: self.recovery.complete(),
            request_id: self.request_id.complete(),
            logger: self.logger.complete(),
            cors: self.cors.complete(),
            timeout: self.timeout.complete(),
            body_limit: self.body_limit.complete(),
            metrics: self.metrics.complete(),
            compression: self.compression.complete(),
            security_headers: self.security_headers.complete(),
            circuit_breaker: self.circuit_breaker.complete(),
            rate_limit: self.rate_limit.complete(),
            health: self.health.complete(),
            auth: self.auth.complete(),
            authz: self.authz.complete(),
            version: self.version.complete(),
            pprof: self.pprof.complete(),
            tracing: self.tracing.complete(),
        }
    }

    /// Validation errors of one record, regardless of whether it is enabled.
    pub fn validate_record(&self, name: MiddlewareName) -> Vec<FieldError> {
        let errors = match name {
            MiddlewareName::Recovery => self.recovery.validate(),
            MiddlewareName::RequestId => self.request_id.validate(),
            MiddlewareName::Logger => self.logger.validate(),
            MiddlewareName::Cors => self.cors.validate(),
            MiddlewareName::Timeout => self.timeout.validate(),
            MiddlewareName::BodyLimit => self.body_limit.validate(),
            MiddlewareName::Metrics => self.metrics.validate(),
            MiddlewareName::Compression => self.compression.validate(),
            MiddlewareName::SecurityHeaders => self.security_headers.validate(),
            MiddlewareName::CircuitBreaker => self.circuit_breaker.validate(),
            MiddlewareName::RateLimit => self.rate_limit.validate(),
            MiddlewareName::Health => self.health.validate(),
            MiddlewareName::Auth => self.auth.validate(),
            MiddlewareName::Authz => self.authz.validate(),
            MiddlewareName::Version => self.version.validate(),
            MiddlewareName::Pprof => self.pprof.validate(),
            MiddlewareName::Tracing => self.tracing.validate(),
        };
        errors
            .into_iter()
            .map(|e| e.nested(name.as_str()))
            .collect()
    }
}

impl Validate for Options {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors: Vec<FieldError> = self
            .unknown_names()
            .into_iter()
            .map(|e| FieldError::new("enabled", e.to_string()))
            .collect();
        for name in self.enabled_names() {
            errors.extend(self.validate_record(name));
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration::ConfigDuration;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.enabled_names(), DEFAULT_ENABLED.to_vec());
        assert!(opts.is_valid());
        assert_eq!(opts.timeout.timeout, ConfigDuration::from_secs(30));
        assert_eq!(opts.request_id.header, "X-Request-ID");
    }

    #[test]
    fn test_disabled_records_are_not_validated() {
        let mut opts = Options::default();
        opts.cors.allow_origins.clear();
        assert!(opts.is_valid());
        opts.enable(MiddlewareName::Cors);
        let errors = opts.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "cors.allow-origins");
    }

    #[test]
    fn test_unknown_enabled_name() {
        let mut opts = Options::default();
        opts.enabled.push("gzip".to_string());
        let errors = opts.validate();
        assert_eq!(errors[0].field, "enabled");
        assert!(errors[0].message.contains("gzip"));
    }

    #[test]
    fn test_builders() {
        let opts = Options::empty()
            .with_timeout(TimeoutOptions {
                timeout: ConfigDuration::from_secs(5),
                ..TimeoutOptions::default()
            })
            .with(MiddlewareName::Recovery)
            .with(MiddlewareName::Recovery);
        assert_eq!(
            opts.enabled_names(),
            vec![MiddlewareName::Timeout, MiddlewareName::Recovery]
        );
        assert_eq!(opts.timeout.timeout, ConfigDuration::from_secs(5));
        let opts = opts.without(MiddlewareName::Timeout);
        assert_eq!(opts.enabled, vec!["recovery".to_string()]);
    }

    #[test]
    fn test_json_shape() {
        let opts: Options = serde_json::from_str(
            r#"{
                "enabled": ["timeout", "cors"],
                "timeout": {"timeout": "5s", "skip-paths": ["/slow"]},
                "cors": {"allow-origins": ["https://example.com"], "max-age": 600}
            }"#,
        )
        .unwrap();
        assert!(opts.is_valid());
        assert_eq!(opts.timeout.timeout, ConfigDuration::from_secs(5));
        assert!(opts.timeout.skip.should_skip("/slow"));
        assert_eq!(opts.cors.max_age, 600);
        assert_eq!(opts.cors.allow_methods.len(), 7);
    }

    #[test]
    fn test_complete_fills_every_record() {
        let mut opts = Options::default();
        opts.timeout.timeout = ConfigDuration::ZERO;
        opts.health.path.clear();
        let opts = opts.complete();
        assert_eq!(opts.timeout.timeout, DEFAULT_TIMEOUT);
        assert_eq!(opts.health.path, "/health");
    }
}
