//! Built-in middleware stages.
//!
//! Each module holds the stage, its factory and, where it applies, the hook
//! that keeps the stage in sync with hot reloads.

pub mod auth;
pub mod authz;
pub mod body_limit;
pub mod circuit_breaker;
pub mod compression;
pub mod cors;
pub mod logger;
pub mod metrics;
pub mod rate_limit;
pub mod recovery;
pub mod request_id;
pub mod security_headers;
pub mod timeout;
pub mod tracing;

use std::sync::Arc;

pub use self::auth::{AuthStage, Authenticator, Claims};
pub use self::authz::{AuthzStage, Authorizer};
pub use self::body_limit::BodyLimitStage;
pub use self::circuit_breaker::{CircuitBreakerStage, CircuitState};
pub use self::compression::CompressionStage;
pub use self::cors::CorsStage;
pub use self::logger::LoggerStage;
pub use self::metrics::MetricsStage;
pub use self::rate_limit::{client_ip, RateLimitStage};
pub use self::recovery::RecoveryStage;
pub use self::request_id::RequestIdStage;
pub use self::security_headers::SecurityHeadersStage;
pub use self::timeout::TimeoutStage;
pub use self::tracing::TracingStage;

use crate::factory::MiddlewareFactory;

/// One factory per built-in middleware.
pub fn builtin_factories() -> Vec<Arc<dyn MiddlewareFactory>> {
    vec![
        Arc::new(recovery::RecoveryFactory),
        Arc::new(request_id::RequestIdFactory),
        Arc::new(logger::LoggerFactory),
        Arc::new(metrics::MetricsFactory),
        Arc::new(self::tracing::TracingFactory),
        Arc::new(cors::CorsFactory),
        Arc::new(rate_limit::RateLimitFactory),
        Arc::new(body_limit::BodyLimitFactory),
        Arc::new(security_headers::SecurityHeadersFactory),
        Arc::new(timeout::TimeoutFactory),
        Arc::new(circuit_breaker::CircuitBreakerFactory),
        Arc::new(auth::AuthFactory),
        Arc::new(authz::AuthzFactory),
        Arc::new(compression::CompressionFactory),
    ]
}
