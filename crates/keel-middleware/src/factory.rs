//! Construction of middlewares and side routes from option records.
//!
//! Two registries keyed by [`MiddlewareName`] live side by side:
//!
//! - [`MiddlewareFactory`] turns a record into a [`Middleware`]
//! - [`RouteRegistrar`] installs endpoints (health, metrics, version,
//!   profiling) directly on a router
//!
//! Records travel as [`AnyConfig`] so a registry can hold factories for
//! every record type; a factory handed the wrong record fails with
//! [`FactoryError::InvalidConfig`] naming both types. The registry validates
//! each record before its factory sees it.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use keel_config::{
    AuthOptions, AuthzOptions, BodyLimitOptions, CircuitBreakerOptions, CompressionOptions,
    CorsOptions, HealthOptions, LoggerOptions, MetricsOptions, MiddlewareName, Options,
    PprofOptions, RateLimitOptions, RecoveryOptions, ReloadableMiddleware, RequestIdOptions,
    SecurityHeadersOptions, TimeoutOptions, TracingOptions, VersionOptions,
};
use keel_core::{FieldError, Middleware, Router, Validate};
use tracing::debug;

use crate::error::FactoryError;

/// Type-erased configuration record.
pub trait AnyConfig: Send + Sync {
    /// Upcast for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Concrete type name, for error messages.
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync> AnyConfig for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Downcasts `config` to the record a factory expects.
pub fn downcast<'a, T: Any>(
    name: MiddlewareName,
    config: &'a dyn AnyConfig,
) -> Result<&'a T, FactoryError> {
    config
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| FactoryError::InvalidConfig {
            name: name.as_str().to_string(),
            expected: std::any::type_name::<T>(),
            actual: config.type_name(),
        })
}

/// Builds a middleware from its option record.
pub trait MiddlewareFactory: Send + Sync {
    /// Middleware this factory builds.
    fn name(&self) -> MiddlewareName;

    /// True when the middleware needs runtime objects (verifiers, policy
    /// engines) that the options tree cannot carry.
    fn needs_runtime(&self) -> bool {
        false
    }

    /// Builds the middleware.
    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError>;

    /// Builds the middleware and subscribes it to hot reloads.
    ///
    /// Stages without reloadable parameters use [`create`](Self::create).
    fn create_live(
        &self,
        config: &dyn AnyConfig,
        live: &ReloadableMiddleware,
    ) -> Result<Middleware, FactoryError> {
        let _ = live;
        self.create(config)
    }
}

/// Installs side routes for an operational endpoint.
pub trait RouteRegistrar: Send + Sync {
    /// Endpoint name.
    fn name(&self) -> MiddlewareName;

    /// Registers the endpoint routes on `router`.
    fn register_routes(
        &self,
        router: &mut dyn Router,
        config: &dyn AnyConfig,
    ) -> Result<(), FactoryError>;
}

/// The option record that configures `name`.
pub fn record_for(options: &Options, name: MiddlewareName) -> &dyn AnyConfig {
    match name {
        MiddlewareName::Recovery => &options.recovery,
        MiddlewareName::RequestId => &options.request_id,
        MiddlewareName::Logger => &options.logger,
        MiddlewareName::Cors => &options.cors,
        MiddlewareName::Timeout => &options.timeout,
        MiddlewareName::BodyLimit => &options.body_limit,
        MiddlewareName::Metrics => &options.metrics,
        MiddlewareName::Compression => &options.compression,
        MiddlewareName::SecurityHeaders => &options.security_headers,
        MiddlewareName::CircuitBreaker => &options.circuit_breaker,
        MiddlewareName::RateLimit => &options.rate_limit,
        MiddlewareName::Health => &options.health,
        MiddlewareName::Auth => &options.auth,
        MiddlewareName::Authz => &options.authz,
        MiddlewareName::Version => &options.version,
        MiddlewareName::Pprof => &options.pprof,
        MiddlewareName::Tracing => &options.tracing,
    }
}

fn completed_errors<T: Validate + Clone + 'static>(
    config: &dyn AnyConfig,
    complete: fn(T) -> T,
) -> Vec<FieldError> {
    config
        .as_any()
        .downcast_ref::<T>()
        .map_or_else(Vec::new, |record| complete(record.clone()).validate())
}

/// Validates `config` with its defaults filled in, when it is the record
/// `name` reads. A record of another type is left to the factory's
/// downcast, which reports the mismatch.
pub fn validate_config(name: MiddlewareName, config: &dyn AnyConfig) -> Result<(), FactoryError> {
    let errors = match name {
        MiddlewareName::Recovery => completed_errors(config, RecoveryOptions::complete),
        MiddlewareName::RequestId => completed_errors(config, RequestIdOptions::complete),
        MiddlewareName::Logger => completed_errors(config, LoggerOptions::complete),
        MiddlewareName::Cors => completed_errors(config, CorsOptions::complete),
        MiddlewareName::Timeout => completed_errors(config, TimeoutOptions::complete),
        MiddlewareName::BodyLimit => completed_errors(config, BodyLimitOptions::complete),
        MiddlewareName::Metrics => completed_errors(config, MetricsOptions::complete),
        MiddlewareName::Compression => completed_errors(config, CompressionOptions::complete),
        MiddlewareName::SecurityHeaders => {
            completed_errors(config, SecurityHeadersOptions::complete)
        }
        MiddlewareName::CircuitBreaker => {
            completed_errors(config, CircuitBreakerOptions::complete)
        }
        MiddlewareName::RateLimit => completed_errors(config, RateLimitOptions::complete),
        MiddlewareName::Health => completed_errors(config, HealthOptions::complete),
        MiddlewareName::Auth => completed_errors(config, AuthOptions::complete),
        MiddlewareName::Authz => completed_errors(config, AuthzOptions::complete),
        MiddlewareName::Version => completed_errors(config, VersionOptions::complete),
        MiddlewareName::Pprof => completed_errors(config, PprofOptions::complete),
        MiddlewareName::Tracing => completed_errors(config, TracingOptions::complete),
    };
    if errors.is_empty() {
        return Ok(());
    }
    let errors = errors
        .into_iter()
        .map(|e| e.nested(name.as_str()))
        .collect();
    Err(FactoryError::invalid(name.as_str(), errors))
}

/// Factories and route registrars by name.
#[derive(Default, Clone)]
pub struct FactoryRegistry {
    factories: BTreeMap<MiddlewareName, Arc<dyn MiddlewareFactory>>,
    routes: BTreeMap<MiddlewareName, Arc<dyn RouteRegistrar>>,
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FactoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in middleware factory.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for factory in crate::stages::builtin_factories() {
            registry.register_factory(factory);
        }
        registry
    }

    /// Adds or replaces a middleware factory.
    pub fn register_factory(&mut self, factory: Arc<dyn MiddlewareFactory>) -> &mut Self {
        debug!(middleware = %factory.name(), "factory registered");
        self.factories.insert(factory.name(), factory);
        self
    }

    /// Adds or replaces a route registrar.
    pub fn register_route(&mut self, registrar: Arc<dyn RouteRegistrar>) -> &mut Self {
        debug!(endpoint = %registrar.name(), "route registrar registered");
        self.routes.insert(registrar.name(), registrar);
        self
    }

    /// Factory for `name`.
    pub fn factory(&self, name: MiddlewareName) -> Option<&Arc<dyn MiddlewareFactory>> {
        self.factories.get(&name)
    }

    /// Route registrar for `name`.
    pub fn route(&self, name: MiddlewareName) -> Option<&Arc<dyn RouteRegistrar>> {
        self.routes.get(&name)
    }

    /// Names with a middleware factory.
    pub fn factory_names(&self) -> Vec<MiddlewareName> {
        self.factories.keys().copied().collect()
    }

    /// Names with a route registrar.
    pub fn route_names(&self) -> Vec<MiddlewareName> {
        self.routes.keys().copied().collect()
    }

    /// Builds `name` from `config`, rejecting records that fail validation.
    pub fn create(
        &self,
        name: MiddlewareName,
        config: &dyn AnyConfig,
    ) -> Result<Middleware, FactoryError> {
        self.checked(name, config)?.create(config)
    }

    /// Like [`create`](Self::create), subscribed to reloads through `live`.
    pub fn create_live(
        &self,
        name: MiddlewareName,
        config: &dyn AnyConfig,
        live: &ReloadableMiddleware,
    ) -> Result<Middleware, FactoryError> {
        self.checked(name, config)?.create_live(config, live)
    }

    fn checked(
        &self,
        name: MiddlewareName,
        config: &dyn AnyConfig,
    ) -> Result<&Arc<dyn MiddlewareFactory>, FactoryError> {
        let factory = self
            .factory(name)
            .ok_or_else(|| FactoryError::NotRegistered(name.as_str().to_string()))?;
        if factory.needs_runtime() {
            return Err(FactoryError::NeedsRuntime(name.as_str().to_string()));
        }
        validate_config(name, config)?;
        Ok(factory)
    }

    /// Installs the routes for `name`.
    pub fn register_routes(
        &self,
        name: MiddlewareName,
        router: &mut dyn Router,
        config: &dyn AnyConfig,
    ) -> Result<(), FactoryError> {
        let registrar = self
            .route(name)
            .ok_or_else(|| FactoryError::NotRegistered(name.as_str().to_string()))?;
        registrar.register_routes(router, config)
    }
}
