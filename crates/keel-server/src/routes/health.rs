//! Health, liveness and readiness endpoints.
//!
//! - `<path>` runs every registered check
//! - `<liveness_path>` answers `UP` while the process can serve requests
//! - `<readiness_path>` runs the checks and also reports `DOWN` once the
//!   server starts shutting down
//!
//! Every endpoint answers `{status, checks, version?}`, with `503` when the
//! status is `DOWN`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::StatusCode;
use keel_config::{HealthOptions, MiddlewareName};
use keel_core::{handler_fn, Context, Router};
use keel_middleware::factory::downcast;
use keel_middleware::{AnyConfig, FactoryError, RouteRegistrar};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

/// A named dependency probe.
pub type CheckFn = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Overall or per-check state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthState {
    /// Healthy.
    Up,
    /// Unhealthy.
    Down,
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    /// State of the dependency.
    pub status: HealthState,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of every health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Aggregate state.
    pub status: HealthState,
    /// Per-check results by name.
    pub checks: BTreeMap<String, CheckResult>,
    /// Service version, when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl HealthReport {
    /// HTTP status for this report.
    pub fn status_code(&self) -> StatusCode {
        match self.status {
            HealthState::Up => StatusCode::OK,
            HealthState::Down => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

struct Inner {
    checks: RwLock<Vec<(String, CheckFn)>>,
    ready: AtomicBool,
    version: RwLock<Option<String>>,
}

/// Shared set of health checks plus the readiness flag.
///
/// Clones share state, so checks added after the routes are registered are
/// still evaluated.
#[derive(Clone)]
pub struct HealthChecks {
    inner: Arc<Inner>,
}

impl fmt::Debug for HealthChecks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.inner.checks.read().iter().map(|(n, _)| n.clone()).collect();
        f.debug_struct("HealthChecks")
            .field("checks", &names)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Default for HealthChecks {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecks {
    /// Creates an empty, ready set.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                checks: RwLock::new(Vec::new()),
                ready: AtomicBool::new(true),
                version: RwLock::new(None),
            }),
        }
    }

    /// Adds or replaces the check called `name`.
    pub fn add_check<F>(&self, name: impl Into<String>, check: F) -> &Self
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut checks = self.inner.checks.write();
        checks.retain(|(existing, _)| *existing != name);
        checks.push((name, Arc::new(check)));
        self
    }

    /// Sets the version reported by every endpoint.
    pub fn set_version(&self, version: impl Into<String>) -> &Self {
        *self.inner.version.write() = Some(version.into());
        self
    }

    /// Flips readiness.
    pub fn set_ready(&self, ready: bool) {
        self.inner.ready.store(ready, Ordering::SeqCst);
    }

    /// Current readiness flag.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Runs every check.
    pub fn report(&self) -> HealthReport {
        let checks: Vec<(String, CheckFn)> = self.inner.checks.read().clone();
        let mut results = BTreeMap::new();
        let mut status = HealthState::Up;
        for (name, check) in checks {
            let result = match check() {
                Ok(()) => CheckResult {
                    status: HealthState::Up,
                    message: None,
                },
                Err(message) => {
                    warn!(check = %name, %message, "health check failed");
                    status = HealthState::Down;
                    CheckResult {
                        status: HealthState::Down,
                        message: Some(message),
                    }
                }
            };
            results.insert(name, result);
        }
        HealthReport {
            status,
            checks: results,
            version: self.inner.version.read().clone(),
        }
    }

    /// Liveness: no checks, always up.
    pub fn liveness(&self) -> HealthReport {
        HealthReport {
            status: HealthState::Up,
            checks: BTreeMap::new(),
            version: self.inner.version.read().clone(),
        }
    }

    /// Readiness: the checks, and down while the flag is cleared.
    pub fn readiness(&self) -> HealthReport {
        let mut report = self.report();
        if !self.is_ready() {
            report.status = HealthState::Down;
        }
        report
    }
}

fn respond(ctx: &Context, report: &HealthReport) {
    ctx.json(report.status_code(), report);
}

/// Registers the three health endpoints.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistrar {
    checks: HealthChecks,
}

impl HealthRegistrar {
    /// Serves the given checks.
    pub fn new(checks: HealthChecks) -> Self {
        Self { checks }
    }

    /// The shared checks.
    pub fn checks(&self) -> &HealthChecks {
        &self.checks
    }
}

impl RouteRegistrar for HealthRegistrar {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Health
    }

    fn register_routes(&self, router: &mut dyn Router, config: &dyn AnyConfig) -> Result<(), FactoryError> {
        let options: &HealthOptions = downcast(self.name(), config)?;
        let options = options.clone().complete();

        let checks = self.checks.clone();
        router.get(
            &options.path,
            handler_fn(move |ctx: Context| {
                let checks = checks.clone();
                async move { respond(&ctx, &checks.report()) }
            }),
        )?;
        let checks = self.checks.clone();
        router.get(
            &options.liveness_path,
            handler_fn(move |ctx: Context| {
                let checks = checks.clone();
                async move { respond(&ctx, &checks.liveness()) }
            }),
        )?;
        let checks = self.checks.clone();
        router.get(
            &options.readiness_path,
            handler_fn(move |ctx: Context| {
                let checks = checks.clone();
                async move { respond(&ctx, &checks.readiness()) }
            }),
        )?;
        Ok(())
    }
}
