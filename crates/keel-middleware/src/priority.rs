//! Priority bands for the built-in middlewares.
//!
//! Higher values are installed first and therefore wrap everything below
//! them. The table is data: [`priority_of`] is the only place a name is
//! mapped to a band.

use keel_config::MiddlewareName;

/// Panic recovery; wraps everything.
pub const RECOVERY: i32 = 1000;
/// Request id; must exist before anything logs.
pub const REQUEST_ID: i32 = 900;
/// Access log.
pub const LOGGER: i32 = 800;
/// Request metrics.
pub const METRICS: i32 = 700;
/// Distributed tracing.
pub const TRACING: i32 = 650;
/// Cross-origin resource sharing.
pub const CORS: i32 = 600;
/// Rate limiting.
pub const RATE_LIMIT: i32 = 560;
/// Request body cap.
pub const BODY_LIMIT: i32 = 550;
/// Security response headers.
pub const SECURITY_HEADERS: i32 = 540;
/// Request deadline.
pub const TIMEOUT: i32 = 500;
/// Circuit breaker.
pub const CIRCUIT_BREAKER: i32 = 450;
/// Authentication.
pub const AUTH: i32 = 400;
/// Authorization.
pub const AUTHZ: i32 = 300;
/// Response compression.
pub const COMPRESSION: i32 = 200;
/// Application middlewares without a band.
pub const CUSTOM: i32 = 100;

/// Band for a built-in name. Route-only names fall into [`CUSTOM`].
pub const fn priority_of(name: MiddlewareName) -> i32 {
    match name {
        MiddlewareName::Recovery => RECOVERY,
        MiddlewareName::RequestId => REQUEST_ID,
        MiddlewareName::Logger => LOGGER,
        MiddlewareName::Metrics => METRICS,
        MiddlewareName::Tracing => TRACING,
        MiddlewareName::Cors => CORS,
        MiddlewareName::RateLimit => RATE_LIMIT,
        MiddlewareName::BodyLimit => BODY_LIMIT,
        MiddlewareName::SecurityHeaders => SECURITY_HEADERS,
        MiddlewareName::Timeout => TIMEOUT,
        MiddlewareName::CircuitBreaker => CIRCUIT_BREAKER,
        MiddlewareName::Auth => AUTH,
        MiddlewareName::Authz => AUTHZ,
        MiddlewareName::Compression => COMPRESSION,
        MiddlewareName::Health | MiddlewareName::Version | MiddlewareName::Pprof => CUSTOM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands_are_strictly_ordered() {
        let order = [
            MiddlewareName::Recovery,
            MiddlewareName::RequestId,
            MiddlewareName::Logger,
            MiddlewareName::Metrics,
            MiddlewareName::Tracing,
            MiddlewareName::Cors,
            MiddlewareName::RateLimit,
            MiddlewareName::BodyLimit,
            MiddlewareName::SecurityHeaders,
            MiddlewareName::Timeout,
            MiddlewareName::CircuitBreaker,
            MiddlewareName::Auth,
            MiddlewareName::Authz,
            MiddlewareName::Compression,
        ];
        for pair in order.windows(2) {
            assert!(
                priority_of(pair[0]) > priority_of(pair[1]),
                "{} should outrank {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_route_names_are_custom() {
        for name in MiddlewareName::ALL.into_iter().filter(|n| n.is_route()) {
            assert_eq!(priority_of(name), CUSTOM);
        }
    }
}
