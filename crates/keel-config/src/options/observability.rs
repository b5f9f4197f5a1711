//! Metrics, tracing and operational endpoint records.

use super::request::probe_paths;
use crate::matcher::PathMatcher;
use keel_core::{FieldError, Validate};
use serde::{Deserialize, Serialize};

fn check_path(errors: &mut Vec<FieldError>, field: &str, path: &str) {
    if !path.starts_with('/') {
        errors.push(FieldError::new(field, format!("{path:?} must start with '/'")));
    }
}

fn or_default(value: &mut String, default: &str) {
    if value.is_empty() {
        *value = default.to_string();
    }
}

/// Request metrics and scrape endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MetricsOptions {
    /// Scrape endpoint path.
    pub path: String,
    /// Metric name namespace.
    pub namespace: String,
    /// Metric name subsystem.
    pub subsystem: String,
    /// Paths that are not measured.
    #[serde(flatten)]
    pub skip: PathMatcher,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            path: "/metrics".to_string(),
            namespace: "keel".to_string(),
            subsystem: "http".to_string(),
            skip: PathMatcher::default(),
        }
    }
}

impl Validate for MetricsOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_path(&mut errors, "path", &self.path);
        errors
    }
}

impl MetricsOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        let defaults = Self::default();
        or_default(&mut self.path, &defaults.path);
        or_default(&mut self.namespace, &defaults.namespace);
        or_default(&mut self.subsystem, &defaults.subsystem);
        self
    }

    /// `namespace_subsystem_` prefix, skipping empty parts.
    pub fn prefix(&self) -> String {
        [self.namespace.as_str(), self.subsystem.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .fold(String::new(), |mut acc, part| {
                acc.push_str(part);
                acc.push('_');
                acc
            })
    }
}

/// Distributed tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TracingOptions {
    /// `service.name` resource attribute.
    pub service_name: String,
    /// OTLP collector endpoint; empty keeps spans in-process.
    pub otlp_endpoint: String,
    /// Fraction of traces sampled.
    pub sample_ratio: f64,
    /// Record the request body on the span.
    pub capture_request_body: bool,
    /// Record the response body on the span.
    pub capture_response_body: bool,
    /// Captured bodies are truncated to this many bytes.
    pub max_body_size: usize,
    /// Paths that are not traced.
    #[serde(flatten)]
    pub skip: PathMatcher,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            service_name: "keel".to_string(),
            otlp_endpoint: String::new(),
            sample_ratio: 1.0,
            capture_request_body: false,
            capture_response_body: false,
            max_body_size: 4096,
            skip: PathMatcher::paths(probe_paths()),
        }
    }
}

impl Validate for TracingOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if !(0.0..=1.0).contains(&self.sample_ratio) {
            errors.push(FieldError::new("sample-ratio", "must be within [0, 1]"));
        }
        errors
    }
}

impl TracingOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        or_default(&mut self.service_name, "keel");
        if self.max_body_size == 0 {
            self.max_body_size = 4096;
        }
        self
    }
}

/// Health endpoint paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HealthOptions {
    /// Aggregate health.
    pub path: String,
    /// Liveness probe.
    pub liveness_path: String,
    /// Readiness probe.
    pub readiness_path: String,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            liveness_path: "/live".to_string(),
            readiness_path: "/ready".to_string(),
        }
    }
}

impl Validate for HealthOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_path(&mut errors, "path", &self.path);
        check_path(&mut errors, "liveness-path", &self.liveness_path);
        check_path(&mut errors, "readiness-path", &self.readiness_path);
        errors
    }
}

impl HealthOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        let defaults = Self::default();
        or_default(&mut self.path, &defaults.path);
        or_default(&mut self.liveness_path, &defaults.liveness_path);
        or_default(&mut self.readiness_path, &defaults.readiness_path);
        self
    }
}

/// Version endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VersionOptions {
    /// Endpoint path.
    pub path: String,
    /// Report only the version string.
    pub hide_details: bool,
}

impl Default for VersionOptions {
    fn default() -> Self {
        Self {
            path: "/version".to_string(),
            hide_details: false,
        }
    }
}

impl Validate for VersionOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_path(&mut errors, "path", &self.path);
        errors
    }
}

impl VersionOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        or_default(&mut self.path, "/version");
        self
    }
}

/// Profiling endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PprofOptions {
    /// Route prefix.
    pub prefix: String,
    /// Serve `<prefix>/cmdline`.
    pub enable_cmdline: bool,
    /// Serve `<prefix>/profile`.
    pub enable_profile: bool,
    /// Serve `<prefix>/symbol`.
    pub enable_symbol: bool,
    /// Serve `<prefix>/trace`.
    pub enable_trace: bool,
    /// Serve `<prefix>/runtime`.
    pub enable_runtime: bool,
}

impl Default for PprofOptions {
    fn default() -> Self {
        Self {
            prefix: "/debug/pprof".to_string(),
            enable_cmdline: true,
            enable_profile: true,
            enable_symbol: true,
            enable_trace: true,
            enable_runtime: true,
        }
    }
}

impl Validate for PprofOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_path(&mut errors, "prefix", &self.prefix);
        if self.prefix.len() > 1 && self.prefix.ends_with('/') {
            errors.push(FieldError::new("prefix", "must not end with '/'"));
        }
        errors
    }
}

impl PprofOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        or_default(&mut self.prefix, "/debug/pprof");
        self
    }
}
