//! Assembly of a service from options.
//!
//! [`Chassis::build`] runs the startup sequence in a fixed order:
//!
//! 1. validate the options tree
//! 2. build every enabled middleware through its factory, subscribed to
//!    hot reloads
//! 3. install them on a fresh router in priority order
//! 4. register the operational endpoints (health, metrics, version, pprof)
//!
//! Business routes are added to [`Service::router`] afterwards, so they
//! always run inside the full middleware chain.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use keel_config::{ConfigWatcher, MiddlewareName, Options, ReloadableMiddleware};
use keel_core::{Middleware, Validate};
use keel_middleware::{record_for, Entry, FactoryRegistry, MiddlewareFactory, Registrar, RouteRegistrar};
use keel_server::routes::VersionRegistrar;
use keel_telemetry::TelemetryConfig;
use keel_server::{
    builtin_registrars, HealthChecks, HttpRouter, Server, ServerConfig, ServerHandle, VersionInfo,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ChassisError, ChassisResult};

struct Custom {
    name: String,
    priority: i32,
    middleware: Middleware,
}

/// Builder wiring options, factories, registrar and router together.
pub struct Chassis {
    options: Options,
    factories: FactoryRegistry,
    stages: HashMap<MiddlewareName, Middleware>,
    custom: Vec<Custom>,
    health: HealthChecks,
    version: VersionInfo,
    server: ServerConfig,
}

impl std::fmt::Debug for Chassis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chassis")
            .field("enabled", &self.options.enabled)
            .field("factories", &self.factories)
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .field("custom", &self.custom.iter().map(|c| &c.name).collect::<Vec<_>>())
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Chassis {
    /// Starts from `options` with the built-in factories and endpoints.
    pub fn new(options: Options) -> Self {
        let health = HealthChecks::new();
        let version = VersionInfo::default();
        let mut factories = FactoryRegistry::with_builtin();
        for registrar in builtin_registrars(health.clone(), version.clone()) {
            factories.register_route(registrar);
        }
        Self {
            options,
            factories,
            stages: HashMap::new(),
            custom: Vec::new(),
            health,
            version,
            server: ServerConfig::default(),
        }
    }

    /// Sets the listener configuration.
    #[must_use]
    pub fn server_config(mut self, config: ServerConfig) -> Self {
        self.server = config;
        self
    }

    /// Reports `info` on the version endpoint and in health reports.
    #[must_use]
    pub fn version(mut self, info: VersionInfo) -> Self {
        self.version = info;
        self
    }

    /// Replaces the factory for its middleware.
    #[must_use]
    pub fn factory(mut self, factory: Arc<dyn MiddlewareFactory>) -> Self {
        self.factories.register_factory(factory);
        self
    }

    /// Replaces the registrar for its endpoint.
    #[must_use]
    pub fn route_registrar(mut self, registrar: Arc<dyn RouteRegistrar>) -> Self {
        self.factories.register_route(registrar);
        self
    }

    /// Supplies a middleware built by the host, used instead of the factory.
    ///
    /// Auth and authz need runtime objects (verifier, policy engine) and can
    /// only be enabled this way.
    #[must_use]
    pub fn stage(mut self, name: MiddlewareName, middleware: Middleware) -> Self {
        self.stages.insert(name, middleware);
        self
    }

    /// Adds an application middleware at `priority`.
    #[must_use]
    pub fn middleware(mut self, name: impl Into<String>, priority: i32, middleware: Middleware) -> Self {
        self.custom.push(Custom {
            name: name.into(),
            priority,
            middleware,
        });
        self
    }

    /// Health checks served by the health endpoints.
    pub fn health(&self) -> &HealthChecks {
        &self.health
    }

    /// Telemetry settings matching the options: the metrics prefix, and the
    /// OpenTelemetry pipeline only when `tracing` is enabled.
    ///
    /// Pass the result to [`keel_telemetry::init_telemetry`] before
    /// [`build`](Self::build) so startup events are captured.
    pub fn telemetry(&self) -> TelemetryConfig {
        let options = self.options.clone().complete();
        let name = if options.tracing.service_name.is_empty() {
            "keel"
        } else {
            options.tracing.service_name.as_str()
        };
        let config = TelemetryConfig::service(name, &self.version.git_version)
            .with_metrics_prefix(&options.metrics.namespace, &options.metrics.subsystem);
        if options.is_enabled(MiddlewareName::Tracing) {
            config.with_otlp(&options.tracing.otlp_endpoint, options.tracing.sample_ratio)
        } else {
            config.without_tracing()
        }
    }

    /// Builds the middleware chain and the operational endpoints.
    pub fn build(mut self) -> ChassisResult<Service> {
        let options = self.options.clone().complete();
        let errors = options.validate();
        if !errors.is_empty() {
            return Err(ChassisError::Invalid(errors));
        }

        self.factories
            .register_route(Arc::new(VersionRegistrar::new(self.version.clone())));
        self.health.set_version(self.version.git_version.clone());

        let live = Arc::new(ReloadableMiddleware::new(options.clone()));
        let mut registrar = Registrar::new();
        let enabled = options.enabled_names();

        for &name in &enabled {
            if let Some(middleware) = self.stages.remove(&name) {
                registrar.register_named(name, middleware)?;
                continue;
            }
            if self.factories.factory(name).is_none() {
                continue;
            }
            let middleware = self
                .factories
                .create_live(name, record_for(&options, name), &live)
                .map_err(|source| ChassisError::factory(name, source))?;
            registrar.register_named(name, middleware)?;
        }
        for name in self.stages.keys() {
            warn!(middleware = %name, "stage supplied for a disabled middleware; ignored");
        }
        for custom in self.custom {
            registrar.register(custom.name, custom.priority, custom.middleware)?;
        }

        let mut router = HttpRouter::new();
        registrar.apply(&mut router);

        for &name in &enabled {
            if self.factories.route(name).is_none() {
                continue;
            }
            self.factories
                .register_routes(name, &mut router, record_for(&options, name))
                .map_err(|source| ChassisError::factory(name, source))?;
        }

        let chain = registrar.list();
        info!(
            middlewares = ?chain.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            routes = router.routes().len(),
            "service assembled"
        );

        Ok(Service {
            router,
            live,
            health: self.health,
            server: self.server,
            chain,
        })
    }
}

/// An assembled service: router, live options and health state.
pub struct Service {
    router: HttpRouter,
    live: Arc<ReloadableMiddleware>,
    health: HealthChecks,
    server: ServerConfig,
    chain: Vec<Entry>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("router", &self.router)
            .field("chain", &self.chain.iter().map(|e| &e.name).collect::<Vec<_>>())
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Router for business routes. Clones share the same route table.
    pub fn router(&self) -> HttpRouter {
        self.router.clone()
    }

    /// Live options; reloads go through here.
    pub fn live(&self) -> &Arc<ReloadableMiddleware> {
        &self.live
    }

    /// Health state shared with the endpoints and the server.
    pub fn health(&self) -> &HealthChecks {
        &self.health
    }

    /// Installed middlewares, outermost first.
    pub fn chain(&self) -> &[Entry] {
        &self.chain
    }

    /// Reloads options whenever `path` changes, until the watcher stops.
    ///
    /// Must be called inside a tokio runtime.
    pub fn watch_config(&self, path: impl AsRef<Path>) -> ChassisResult<JoinHandle<()>> {
        let mut watcher = ConfigWatcher::new(path, Arc::clone(&self.live))?;
        Ok(tokio::spawn(async move {
            while let Some(result) = watcher.next_reload().await {
                match result {
                    Ok(report) if report.is_unchanged() => {}
                    Ok(report) => info!(
                        changed = ?report.changed,
                        restart_required = report.restart_required,
                        "configuration file applied"
                    ),
                    Err(err) => error!(error = %err, "configuration file rejected"),
                }
            }
        }))
    }

    /// Converts into a server bound to the configured address.
    pub fn into_server(self) -> Server {
        Server::new(self.server, self.router).with_health(self.health)
    }

    /// Binds and starts serving. See [`Server::start`].
    pub fn start(self) -> ChassisResult<ServerHandle> {
        Ok(self.into_server().start()?)
    }
}
