//! Operational endpoints installed as side routes.
//!
//! Each registrar implements [`RouteRegistrar`] for its option record and is
//! installed by the chassis after the middleware chain is applied, so probes
//! and scrapes pass through the same middlewares as business routes unless
//! those middlewares skip them.

pub mod health;
pub mod metrics;
pub mod pprof;
pub mod version;

use std::sync::Arc;

use keel_middleware::RouteRegistrar;

pub use self::health::{CheckResult, HealthChecks, HealthRegistrar, HealthReport, HealthState};
pub use self::metrics::MetricsRegistrar;
pub use self::pprof::{PprofRegistrar, RuntimeSnapshot};
pub use self::version::{VersionInfo, VersionRegistrar};

/// The four built-in registrars, sharing `health` and reporting `version`.
pub fn builtin_registrars(health: HealthChecks, version: VersionInfo) -> Vec<Arc<dyn RouteRegistrar>> {
    vec![
        Arc::new(HealthRegistrar::new(health)),
        Arc::new(MetricsRegistrar),
        Arc::new(VersionRegistrar::new(version)),
        Arc::new(PprofRegistrar),
    ]
}
