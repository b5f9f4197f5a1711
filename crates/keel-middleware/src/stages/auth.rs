//! Token authentication.
//!
//! The token is looked up from the sources listed in `token_lookup`, in
//! order. Header tokens must carry the configured scheme (`Bearer` by
//! default, matched case-insensitively). Verification is delegated to an
//! [`Authenticator`]; verified [`Claims`] are stored in the context for the
//! authorization stage and handlers.
//!
//! Failures are written to the audit log with only a short token prefix.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::COOKIE;
use keel_config::{parse_token_lookup, AuthOptions, MiddlewareName, PathMatcher, TokenLookup, TokenSource};
use keel_core::{BoxFuture, Context, FieldError, Handler, KeelError, Middleware};
use keel_telemetry::AUDIT_TARGET;
use tracing::{debug, warn};

use crate::error::FactoryError;
use crate::factory::{AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

const MAX_TOKEN_PREFIX: usize = 20;

/// Identity established by an [`Authenticator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims {
    /// Authenticated principal.
    pub subject: String,
    /// Roles granted to the principal.
    pub roles: Vec<String>,
    /// Free-form attributes carried by the token.
    pub attributes: HashMap<String, String>,
}

impl Claims {
    /// Claims for `subject` with no roles.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }

    /// Adds a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// True when `role` was granted.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Verifies a bearer token.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the claims carried by `token`, or the error to answer with.
    async fn verify(&self, ctx: &Context, token: &str) -> Result<Claims, KeelError>;
}

/// Called after a successful verification.
pub type AuthSuccessCallback = Arc<dyn Fn(&Context, &Claims) + Send + Sync>;

/// Normalizes a token to the URL-safe base64 alphabet without padding.
pub fn sanitize_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect::<String>()
        .trim_end_matches('=')
        .to_string()
}

/// First `min(20, len / 2)` characters of `token` followed by `...`.
pub fn token_prefix(token: &str) -> String {
    let shown = MAX_TOKEN_PREFIX.min(token.chars().count() / 2);
    let prefix: String = token.chars().take(shown).collect();
    format!("{prefix}...")
}

fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name).then(|| value.trim())
    })
}

fn strip_scheme<'a>(value: &'a str, scheme: &str) -> Option<&'a str> {
    let value = value.trim();
    if scheme.is_empty() {
        return Some(value);
    }
    let head = value.get(..scheme.len())?;
    let rest = value.get(scheme.len()..)?;
    (head.eq_ignore_ascii_case(scheme) && rest.starts_with(' ')).then(|| rest.trim())
}

/// Authenticates requests with an [`Authenticator`].
pub struct AuthStage {
    authenticator: Arc<dyn Authenticator>,
    lookups: Vec<TokenLookup>,
    scheme: String,
    skip: PathMatcher,
    on_success: Option<AuthSuccessCallback>,
}

impl std::fmt::Debug for AuthStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStage")
            .field("lookups", &self.lookups)
            .field("scheme", &self.scheme)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}

impl AuthStage {
    /// Creates the stage.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::Invalid`] when `token_lookup` does not parse.
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        options: AuthOptions,
    ) -> Result<Self, FactoryError> {
        let options = options.complete();
        let lookups = parse_token_lookup(&options.token_lookup).map_err(|reason| {
            FactoryError::invalid(
                "auth",
                vec![FieldError::new("token-lookup", reason).nested("auth")],
            )
        })?;
        Ok(Self {
            authenticator,
            lookups,
            scheme: options.auth_scheme,
            skip: options.skip,
            on_success: None,
        })
    }

    /// Sets the callback fired after each successful verification.
    #[must_use]
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &Claims) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Token from the first lookup that yields one.
    pub fn extract_token(&self, ctx: &Context) -> Option<String> {
        self.lookups.iter().find_map(|lookup| {
            let raw = match lookup.source {
                TokenSource::Header => ctx
                    .header(&lookup.name)
                    .and_then(|v| strip_scheme(v, &self.scheme))
                    .map(str::to_string),
                TokenSource::Query => ctx.query(&lookup.name),
                TokenSource::Cookie => ctx
                    .header(COOKIE.as_str())
                    .and_then(|h| cookie_value(h, &lookup.name))
                    .map(str::to_string),
            }?;
            let token = sanitize_token(&raw);
            (!token.is_empty()).then_some(token)
        })
    }

    fn audit_failure(ctx: &Context, token: Option<&str>, reason: &str) {
        warn!(
            target: AUDIT_TARGET,
            event = "authentication_failed",
            reason,
            token_prefix = %token.map(token_prefix).unwrap_or_default(),
            remote_addr = %ctx.remote_addr(),
            path = %ctx.path(),
            method = %ctx.method(),
            request_id = ctx.request_id().unwrap_or(""),
            "authentication failed"
        );
    }
}

impl Stage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn handle(self: Arc<Self>, mut ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.skip.should_skip(ctx.path()) {
                next(ctx).await;
                return;
            }

            let Some(token) = self.extract_token(&ctx) else {
                Self::audit_failure(&ctx, None, "missing token");
                ctx.error(&KeelError::unauthorized("missing or malformed token"));
                return;
            };

            match self.authenticator.verify(&ctx, &token).await {
                Ok(claims) => {
                    debug!(subject = %claims.subject, "request authenticated");
                    if let Some(callback) = &self.on_success {
                        callback(&ctx, &claims);
                    }
                    ctx.insert_value(claims);
                    next(ctx).await;
                }
                Err(err) => {
                    Self::audit_failure(&ctx, Some(&token), &err.to_string());
                    ctx.error(&err);
                }
            }
        })
    }
}

/// Placeholder factory: authentication needs an [`Authenticator`], so the
/// stage is built by the host with [`AuthStage::new`].
#[derive(Debug, Clone, Copy)]
pub struct AuthFactory;

impl MiddlewareFactory for AuthFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Auth
    }

    fn needs_runtime(&self) -> bool {
        true
    }

    fn create(&self, _config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        Err(FactoryError::NeedsRuntime(self.name().as_str().to_string()))
    }
}
