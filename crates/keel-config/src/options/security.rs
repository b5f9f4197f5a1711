//! CORS, security header, authentication and authorization records.

use crate::matcher::PathMatcher;
use keel_core::{FieldError, Validate};
use serde::{Deserialize, Serialize};

/// Default HSTS max-age (one year).
pub const DEFAULT_HSTS_MAX_AGE: i64 = 31_536_000;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn default_cors_methods() -> Vec<String> {
    strings(&["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"])
}

fn default_cors_headers() -> Vec<String> {
    strings(&[
        "Origin",
        "Content-Type",
        "Accept",
        "Authorization",
        "X-Request-ID",
    ])
}

/// Cross-origin resource sharing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CorsOptions {
    /// Allowed origins; `*` allows any origin.
    pub allow_origins: Vec<String>,
    /// Methods announced on preflight.
    pub allow_methods: Vec<String>,
    /// Headers announced on preflight.
    pub allow_headers: Vec<String>,
    /// Headers exposed to scripts.
    pub expose_headers: Vec<String>,
    /// Send `Access-Control-Allow-Credentials: true`.
    pub allow_credentials: bool,
    /// Preflight cache lifetime in seconds.
    pub max_age: i64,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            allow_origins: strings(&["*"]),
            allow_methods: default_cors_methods(),
            allow_headers: default_cors_headers(),
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age: 86_400,
        }
    }
}

impl Validate for CorsOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.allow_origins.is_empty() {
            errors.push(FieldError::new("allow-origins", "must not be empty"));
        }
        let wildcard = self.allow_origins.iter().any(|o| o == "*");
        if wildcard && self.allow_credentials {
            errors.push(FieldError::new(
                "allow-origins",
                "wildcard origin \"*\" cannot be combined with allow-credentials",
            ));
        }
        for origin in self.allow_origins.iter().filter(|o| o.as_str() != "*") {
            if let Err(reason) = check_origin(origin) {
                errors.push(FieldError::new(
                    "allow-origins",
                    format!("invalid origin {origin:?}: {reason}"),
                ));
            }
        }
        if self.max_age < 0 {
            errors.push(FieldError::new("max-age", "must not be negative"));
        }
        errors
    }
}

impl CorsOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        if self.allow_methods.is_empty() {
            self.allow_methods = default_cors_methods();
        }
        if self.allow_headers.is_empty() {
            self.allow_headers = default_cors_headers();
        }
        self
    }

    /// True when `origin` is allowed.
    pub fn allows_origin(&self, origin: &str) -> bool {
        self.allow_origins.iter().any(|o| o == "*" || o == origin)
    }
}

/// Checks that an origin is `scheme://host[:port]` with nothing after it.
fn check_origin(origin: &str) -> Result<(), &'static str> {
    let rest = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .ok_or("must start with http:// or https://")?;
    if rest.is_empty() {
        return Err("missing host");
    }
    if rest.contains('/') {
        return Err("must not contain a path");
    }
    if rest.contains('?') {
        return Err("must not contain a query");
    }
    if rest.contains('#') {
        return Err("must not contain a fragment");
    }
    rest.parse::<http::uri::Authority>()
        .map(|_| ())
        .map_err(|_| "invalid host")
}

/// Security response header settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SecurityHeadersOptions {
    /// `X-Frame-Options` value.
    pub x_frame_options: String,
    /// `X-Content-Type-Options` value.
    pub x_content_type_options: String,
    /// `X-XSS-Protection` value.
    pub x_xss_protection: String,
    /// `Content-Security-Policy` value.
    pub content_security_policy: String,
    /// `Referrer-Policy` value.
    pub referrer_policy: String,
    /// Emit `Strict-Transport-Security` on HTTPS requests.
    pub enable_hsts: bool,
    /// HSTS max-age in seconds.
    pub hsts_max_age: i64,
    /// Append `includeSubDomains`.
    pub hsts_include_subdomains: bool,
    /// Append `preload`.
    pub hsts_preload: bool,
}

impl Default for SecurityHeadersOptions {
    fn default() -> Self {
        Self {
            x_frame_options: "DENY".to_string(),
            x_content_type_options: "nosniff".to_string(),
            x_xss_protection: "1; mode=block".to_string(),
            content_security_policy: "default-src 'self'".to_string(),
            referrer_policy: "strict-origin-when-cross-origin".to_string(),
            enable_hsts: false,
            hsts_max_age: DEFAULT_HSTS_MAX_AGE,
            hsts_include_subdomains: false,
            hsts_preload: false,
        }
    }
}

impl Validate for SecurityHeadersOptions {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.enable_hsts && self.hsts_max_age < 0 {
            errors.push(FieldError::new("hsts-max-age", "must not be negative"));
        }
        errors
    }
}

impl SecurityHeadersOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        if self.hsts_max_age == 0 {
            self.hsts_max_age = DEFAULT_HSTS_MAX_AGE;
        }
        self
    }

    /// Rendered `Strict-Transport-Security` value.
    pub fn hsts_value(&self) -> String {
        let mut value = format!("max-age={}", self.hsts_max_age);
        if self.hsts_include_subdomains {
            value.push_str("; includeSubDomains");
        }
        if self.hsts_preload {
            value.push_str("; preload");
        }
        value
    }
}

/// Where a token is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Request header.
    Header,
    /// Query parameter.
    Query,
    /// Cookie.
    Cookie,
}

/// One `source:name` entry of a token lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLookup {
    /// Source.
    pub source: TokenSource,
    /// Header, parameter or cookie name.
    pub name: String,
}

/// Parses `header:Authorization,query:token` into lookups.
pub fn parse_token_lookup(lookup: &str) -> Result<Vec<TokenLookup>, String> {
    lookup.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (source, name) = part
                .split_once(':')
                .ok_or_else(|| format!("{part:?} must be source:name"))?;
            let source = match source.trim() {
                "header" => TokenSource::Header,
                "query" => TokenSource::Query,
                "cookie" => TokenSource::Cookie,
                other => return Err(format!("unknown token source {other:?}")),
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(format!("{part:?} has an empty name"));
            }
            Ok(TokenLookup {
                source,
                name: name.to_string(),
            })
        })
        .collect()
}

/// Authentication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuthOptions {
    /// Comma separated `source:name` lookups, tried in order.
    pub token_lookup: String,
    /// Scheme prefix stripped from header tokens.
    pub auth_scheme: String,
    /// Unauthenticated paths.
    #[serde(flatten)]
    pub skip: PathMatcher,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            token_lookup: "header:Authorization".to_string(),
            auth_scheme: "Bearer".to_string(),
            skip: PathMatcher::default(),
        }
    }
}

impl Validate for AuthOptions {
    fn validate(&self) -> Vec<FieldError> {
        match parse_token_lookup(&self.token_lookup) {
            Ok(lookups) if lookups.is_empty() => {
                vec![FieldError::new("token-lookup", "must not be empty")]
            }
            Ok(_) => Vec::new(),
            Err(reason) => vec![FieldError::new("token-lookup", reason)],
        }
    }
}

impl AuthOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(mut self) -> Self {
        let defaults = Self::default();
        if self.token_lookup.trim().is_empty() {
            self.token_lookup = defaults.token_lookup;
        }
        if self.auth_scheme.is_empty() {
            self.auth_scheme = defaults.auth_scheme;
        }
        self
    }
}

/// Authorization settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuthzOptions {
    /// Paths that skip authorization.
    #[serde(flatten)]
    pub skip: PathMatcher,
    /// Prefixes stripped before taking the resource segment, longest first.
    pub api_prefixes: Vec<String>,
}

impl Default for AuthzOptions {
    fn default() -> Self {
        Self {
            skip: PathMatcher::default(),
            api_prefixes: strings(&["/api/v1", "/api/v2", "/api", "/v1", "/v2"]),
        }
    }
}

impl Validate for AuthzOptions {
    fn validate(&self) -> Vec<FieldError> {
        self.api_prefixes
            .iter()
            .filter(|p| !p.starts_with('/'))
            .map(|p| FieldError::new("api-prefixes", format!("{p:?} must start with '/'")))
            .collect()
    }
}

impl AuthzOptions {
    /// Returns a copy with defaults filled in.
    pub fn complete(self) -> Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_wildcard_with_credentials() {
        let opts = CorsOptions {
            allow_origins: vec!["*".to_string()],
            allow_credentials: true,
            ..CorsOptions::default()
        };
        let errors = opts.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("wildcard"));
        assert!(errors[0].message.contains("credentials"));
    }

    #[test]
    fn test_cors_origin_shape() {
        let bad = [
            "example.com",
            "https://example.com/path",
            "https://example.com?x=1",
            "https://example.com#frag",
            "https://",
        ];
        for origin in bad {
            let opts = CorsOptions {
                allow_origins: vec![origin.to_string()],
                ..CorsOptions::default()
            };
            assert_eq!(opts.validate().len(), 1, "{origin} should be rejected");
        }
        let good = CorsOptions {
            allow_origins: vec!["https://example.com:8443".to_string()],
            allow_credentials: true,
            ..CorsOptions::default()
        };
        assert!(good.is_valid());
    }

    #[test]
    fn test_cors_empty_origins() {
        let opts = CorsOptions {
            allow_origins: Vec::new(),
            ..CorsOptions::default()
        };
        assert_eq!(opts.validate()[0].field, "allow-origins");
    }

    #[test]
    fn test_hsts_value() {
        let opts = SecurityHeadersOptions {
            enable_hsts: true,
            hsts_include_subdomains: true,
            hsts_preload: true,
            hsts_max_age: 0,
            ..SecurityHeadersOptions::default()
        }
        .complete();
        assert_eq!(
            opts.hsts_value(),
            "max-age=31536000; includeSubDomains; preload"
        );
    }

    #[test]
    fn test_parse_token_lookup() {
        let lookups = parse_token_lookup("header:Authorization, query:token").unwrap();
        assert_eq!(lookups.len(), 2);
        assert_eq!(lookups[1].source, TokenSource::Query);
        assert_eq!(lookups[1].name, "token");
        assert!(parse_token_lookup("body:token").is_err());
        assert!(parse_token_lookup("header").is_err());
    }

    #[test]
    fn test_authz_prefix_validation() {
        let opts = AuthzOptions {
            api_prefixes: vec!["api".to_string()],
            ..AuthzOptions::default()
        };
        assert_eq!(opts.validate().len(), 1);
    }
}
