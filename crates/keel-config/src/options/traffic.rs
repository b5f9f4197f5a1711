//! Records for middlewares that shape request flow.

use super::request::probe_paths;
use crate::duration::ConfigDuration;
use crate::matcher::PathMatcher;
use ipnetwork::IpNetwork;
use keel_core::{FieldError, Validate};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Default request deadline.
pub const DEFAULT_TIMEOUT: ConfigDuration = ConfigDuration::from_secs(30);

/// Default request body cap (4 MiB).
pub const DEFAULT_BODY_LIMIT: u64 = 4 * 1024 * 1024;

/// Default rate-limit window.
pub const DEFAULT_RATE_WINDOW: ConfigDuration = ConfigDuration::from_mins(1);

/// Request deadline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TimeoutOptions {
    /// Deadline applied to each request; zero means the default.
    pub timeout: ConfigDuration,
    /// Paths without a deadline.
    #[serde(flatten)]
    pub skip: PathMatcher,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            skip: PathMatcher::paths(probe_paths()),
        }
    }
}

impl Validate for TimeoutOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.timeout.is_negative() {
            errors.push(FieldError::new(
                "timeout",
                format!("must not be negative, got {}", self.timeout),
            ));
        }
        errors
    }
}

impl TimeoutOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        self
    }
}

/// Request body cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BodyLimitOptions {
    /// Maximum body size in bytes.
    pub max_size: u64,
    /// Paths without a cap.
    #[serde(flatten)]
    pub skip: PathMatcher,
}

impl Default for BodyLimitOptions {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_BODY_LIMIT,
            skip: PathMatcher::default(),
        }
    }
}

impl Validate for BodyLimitOptions {
    fn validate(&self) -> Vec<FieldError> {
        Vec::new()
    }
}

impl BodyLimitOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        if self.max_size == 0 {
            self.max_size = DEFAULT_BODY_LIMIT;
        }
        self
    }
}

/// Rate-limit backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimiterBackend {
    /// Per-process sliding window.
    #[default]
    Memory,
    /// Redis sorted sets shared across instances.
    Redis,
}

/// Rate limiting settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RateLimitOptions {
    /// Requests admitted per key per window; zero denies everything.
    pub limit: u64,
    /// Sliding window length.
    pub window: ConfigDuration,
    /// Store used for admission.
    pub backend: LimiterBackend,
    /// Redis URL when `backend = "redis"`.
    pub redis_url: String,
    /// Prefix for Redis keys.
    pub key_prefix: String,
    /// Honor `X-Forwarded-For` and `X-Real-IP` from trusted proxies.
    pub trust_proxy_headers: bool,
    /// Proxy addresses as IPs or CIDRs.
    pub trusted_proxies: Vec<String>,
    /// Paths that are never limited.
    #[serde(flatten)]
    pub skip: PathMatcher,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            window: DEFAULT_RATE_WINDOW,
            backend: LimiterBackend::Memory,
            redis_url: String::new(),
            key_prefix: "ratelimit:".to_string(),
            trust_proxy_headers: false,
            trusted_proxies: Vec::new(),
            skip: PathMatcher::default(),
        }
    }
}

impl Validate for RateLimitOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.window.is_negative() {
            errors.push(FieldError::new("window", "must not be negative"));
        }
        if self.backend == LimiterBackend::Redis && self.redis_url.trim().is_empty() {
            errors.push(FieldError::new(
                "redis-url",
                "is required when backend is redis",
            ));
        }
        for proxy in &self.trusted_proxies {
            if parse_network(proxy).is_none() {
                errors.push(FieldError::new(
                    "trusted-proxies",
                    format!("{proxy:?} is not an IP address or CIDR"),
                ));
            }
        }
        errors
    }
}

impl RateLimitOptions {
    /// Returns a copy with defaults filled in. `limit` is left alone.
    pub fn complete(mut self) -> Self {
        if self.window.is_zero() {
            self.window = DEFAULT_RATE_WINDOW;
        }
        if self.key_prefix.is_empty() {
            self.key_prefix = "ratelimit:".to_string();
        }
        self
    }

    /// Parsed trusted proxies; unparsable entries are dropped.
    pub fn trusted_networks(&self) -> Vec<IpNetwork> {
        self.trusted_proxies
            .iter()
            .filter_map(|p| parse_network(p))
            .collect()
    }
}

/// Parses an IP or a CIDR into a network.
pub fn parse_network(text: &str) -> Option<IpNetwork> {
    let text = text.trim();
    if text.contains('/') {
        text.parse().ok()
    } else {
        text.parse::<IpAddr>().ok().map(IpNetwork::from)
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CircuitBreakerOptions {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,
    /// Failure ratio in `(0, 1]` that opens the circuit; zero disables it.
    pub failure_ratio: f64,
    /// Calls observed before the ratio is considered.
    pub min_requests: u32,
    /// Cool-down before a half-open probe.
    pub timeout: ConfigDuration,
    /// Probes admitted while half-open.
    pub half_open_max_calls: u32,
    /// Responses at or above this status count as failures.
    pub error_threshold: u16,
    /// Paths outside the breaker.
    #[serde(flatten)]
    pub skip: PathMatcher,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            max_failures: 5,
            failure_ratio: 0.0,
            min_requests: 10,
            timeout: ConfigDuration::from_secs(60),
            half_open_max_calls: 1,
            error_threshold: 500,
            skip: PathMatcher::paths(probe_paths()),
        }
    }
}

impl Validate for CircuitBreakerOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.max_failures == 0 && self.failure_ratio <= 0.0 {
            errors.push(FieldError::new(
                "max-failures",
                "must be positive unless failure-ratio is set",
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_ratio) {
            errors.push(FieldError::new("failure-ratio", "must be within [0, 1]"));
        }
        if self.timeout.is_negative() {
            errors.push(FieldError::new("timeout", "must not be negative"));
        }
        if !(100..=599).contains(&self.error_threshold) {
            errors.push(FieldError::new(
                "error-threshold",
                "must be an HTTP status code",
            ));
        }
        errors
    }
}

impl CircuitBreakerOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        let defaults = Self::default();
        if self.timeout.is_zero() {
            self.timeout = defaults.timeout;
        }
        if self.half_open_max_calls == 0 {
            self.half_open_max_calls = defaults.half_open_max_calls;
        }
        if self.error_threshold == 0 {
            self.error_threshold = defaults.error_threshold;
        }
        self
    }
}

/// Response compression settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CompressionOptions {
    /// Compression level, 1 (fast) to 9 (best).
    pub level: u32,
    /// Bodies smaller than this are sent as-is.
    pub min_size: usize,
    /// Eligible content types, matched by prefix.
    pub content_types: Vec<String>,
    /// Paths never compressed.
    #[serde(flatten)]
    pub skip: PathMatcher,
}

fn default_compressible() -> Vec<String> {
    [
        "text/",
        "application/json",
        "application/javascript",
        "application/xml",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            level: 6,
            min_size: 1024,
            content_types: default_compressible(),
            skip: PathMatcher::default(),
        }
    }
}

impl Validate for CompressionOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.level > 9 {
            errors.push(FieldError::new("level", "must be within 1..=9"));
        }
        errors
    }
}

impl CompressionOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        if self.level == 0 {
            self.level = 6;
        }
        if self.content_types.is_empty() {
            self.content_types = default_compressible();
        }
        self
    }

    /// True when a response of `content_type` may be compressed.
    pub fn is_eligible(&self, content_type: &str) -> bool {
        let ct = content_type.trim().to_ascii_lowercase();
        self.content_types
            .iter()
            .any(|prefix| ct.starts_with(&prefix.to_ascii_lowercase()))
    }
}
