//! Live, validated replacement of middleware options.
//!
//! [`ReloadableMiddleware`] owns the running [`Options`]. A reload either
//! replaces every changed record or none of them: validation runs before the
//! write lock is taken, so readers see the complete old snapshot or the
//! complete new one.
//!
//! Middlewares that can change behavior in place register change callbacks.
//! The `enabled` list is structural; changing it is reported as
//! `restart_required` and never applied, because the handler chain is frozen
//! once the registrar has been applied to the router.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use keel_core::{BoxError, FieldError};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::name::MiddlewareName;
use crate::options::{
    CorsOptions, LoggerOptions, Options, RateLimitOptions, RecoveryOptions, TimeoutOptions,
};
use crate::ReloadError;

/// Callback invoked with the new record when it changes.
pub type ChangeCallback<T> = Arc<dyn Fn(&T) -> Result<(), BoxError> + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    timeout: Option<ChangeCallback<TimeoutOptions>>,
    cors: Option<ChangeCallback<CorsOptions>>,
    rate_limit: Option<ChangeCallback<RateLimitOptions>>,
    logger: Option<ChangeCallback<LoggerOptions>>,
    recovery: Option<ChangeCallback<RecoveryOptions>>,
    any: Vec<ChangeCallback<Options>>,
}

/// Outcome of an accepted reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Changed fields as `section.field`, sorted.
    pub changed: Vec<String>,
    /// The submitted `enabled` list differs from the running one.
    pub restart_required: bool,
}

impl ReloadReport {
    /// True when nothing changed.
    pub fn is_unchanged(&self) -> bool {
        self.changed.is_empty() && !self.restart_required
    }
}

/// Holds the live options and applies hot reloads.
pub struct ReloadableMiddleware {
    options: RwLock<Options>,
    callbacks: RwLock<Callbacks>,
}

impl fmt::Debug for ReloadableMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadableMiddleware")
            .field("options", &*self.options.read())
            .finish_non_exhaustive()
    }
}

macro_rules! on_change {
    ($($method:ident => $slot:ident: $ty:ty;)*) => {
        $(
            #[doc = concat!("Registers the callback fired when `", stringify!($slot), "` changes.")]
            pub fn $method<F>(&self, callback: F)
            where
                F: Fn(&$ty) -> Result<(), BoxError> + Send + Sync + 'static,
            {
                self.callbacks.write().$slot = Some(Arc::new(callback));
            }
        )*
    };
}

impl ReloadableMiddleware {
    /// Wraps `options` after filling defaults.
    pub fn new(options: Options) -> Self {
        Self {
            options: RwLock::new(options.complete()),
            callbacks: RwLock::new(Callbacks::default()),
        }
    }

    /// Deep copy of the live options.
    pub fn get_options(&self) -> Options {
        self.options.read().clone()
    }

    on_change! {
        on_timeout_change => timeout: TimeoutOptions;
        on_cors_change => cors: CorsOptions;
        on_rate_limit_change => rate_limit: RateLimitOptions;
        on_logger_change => logger: LoggerOptions;
        on_recovery_change => recovery: RecoveryOptions;
    }

    /// Registers a callback fired with the full options after any change.
    pub fn on_any_change<F>(&self, callback: F)
    where
        F: Fn(&Options) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.callbacks.write().any.push(Arc::new(callback));
    }

    /// Decodes `value` as [`Options`] and reloads it.
    pub fn reload_value(&self, value: Value) -> Result<ReloadReport, ReloadError> {
        let options: Options =
            serde_json::from_value(value).map_err(|e| ReloadError::TypeMismatch {
                expected: "keel_config::Options",
                reason: e.to_string(),
            })?;
        self.reload(options)
    }

    /// Validates and applies `next`.
    ///
    /// Callbacks run while the write lock is held and must not call back
    /// into this value.
    pub fn reload(&self, next: Options) -> Result<ReloadReport, ReloadError> {
        let next = next.complete();

        let errors = self.validate_candidate(&next);
        if !errors.is_empty() {
            warn!(errors = %keel_core::join_field_errors(&errors), "configuration reload rejected");
            return Err(ReloadError::Invalid(errors));
        }

        let mut live = self.options.write();
        let callbacks = self.callbacks.read();

        let restart_required = live.enabled_names() != next.enabled_names();
        if restart_required {
            warn!(
                running = ?live.enabled,
                requested = ?next.enabled,
                "enabled middlewares cannot change at runtime; restart to apply"
            );
        }

        let mut applied = next;
        applied.enabled = live.enabled.clone();
        let changed = diff_fields(&live, &applied);

        if changed.is_empty() {
            debug!("middleware configuration unchanged");
            return Ok(ReloadReport {
                changed,
                restart_required,
            });
        }

        let sections: BTreeSet<&str> = changed
            .iter()
            .filter_map(|field| field.split('.').next())
            .collect();
        *live = applied;

        let fire = |name: MiddlewareName| sections.contains(name.as_str()) && live.is_enabled(name);
        if fire(MiddlewareName::Timeout) {
            notify(MiddlewareName::Timeout, callbacks.timeout.as_ref(), &live.timeout);
        }
        if fire(MiddlewareName::Cors) {
            notify(MiddlewareName::Cors, callbacks.cors.as_ref(), &live.cors);
        }
        if fire(MiddlewareName::RateLimit) {
            notify(MiddlewareName::RateLimit, callbacks.rate_limit.as_ref(), &live.rate_limit);
        }
        if fire(MiddlewareName::Logger) {
            notify(MiddlewareName::Logger, callbacks.logger.as_ref(), &live.logger);
        }
        if fire(MiddlewareName::Recovery) {
            notify(MiddlewareName::Recovery, callbacks.recovery.as_ref(), &live.recovery);
        }
        for callback in &callbacks.any {
            if let Err(e) = callback(&live) {
                error!(error = %e, "options change callback failed");
            }
        }

        info!(changed = ?changed, "middleware configuration reloaded");
        Ok(ReloadReport {
            changed,
            restart_required,
        })
    }

    /// Validates every record enabled in either the running or the new options.
    fn validate_candidate(&self, next: &Options) -> Vec<FieldError> {
        let live = self.options.read();
        let mut errors: Vec<FieldError> = next
            .unknown_names()
            .into_iter()
            .map(|e| FieldError::new("enabled", e.to_string()))
            .collect();
        let names: BTreeSet<MiddlewareName> = live
            .enabled_names()
            .into_iter()
            .chain(next.enabled_names())
            .collect();
        for name in names {
            errors.extend(next.validate_record(name));
        }
        errors
    }
}

fn notify<T>(name: MiddlewareName, callback: Option<&ChangeCallback<T>>, value: &T) {
    if let Some(callback) = callback {
        if let Err(e) = callback(value) {
            error!(middleware = %name, error = %e, "change callback failed");
        }
    }
}

/// Lists `section.field` paths whose values differ.
fn diff_fields(old: &Options, new: &Options) -> Vec<String> {
    let (Ok(Value::Object(old)), Ok(Value::Object(new))) =
        (serde_json::to_value(old), serde_json::to_value(new))
    else {
        return Vec::new();
    };

    let mut changed = Vec::new();
    for (section, new_value) in &new {
        let old_value = old.get(section).unwrap_or(&Value::Null);
        match (old_value, new_value) {
            (Value::Object(old_fields), Value::Object(new_fields)) => {
                for (field, value) in new_fields {
                    if old_fields.get(field) != Some(value) {
                        changed.push(format!("{section}.{field}"));
                    }
                }
            }
            (a, b) if a != b => changed.push(section.clone()),
            _ => {}
        }
    }
    changed.sort();
    changed
}
