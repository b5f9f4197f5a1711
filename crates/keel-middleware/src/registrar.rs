//! Priority-ordered middleware collection.
//!
//! Middlewares can be registered in any order. [`Registrar::apply`] sorts a
//! copy by descending priority, breaking ties by registration order, and
//! installs each entry with [`Router::use_middleware`]. Routers capture
//! middlewares at route registration time, so `apply` must run before the
//! first handler route is added.

use std::fmt;

use keel_config::MiddlewareName;
use keel_core::{Middleware, Router};
use tracing::debug;

use crate::error::RegistrarError;
use crate::priority::priority_of;

/// One registered middleware.
#[derive(Clone)]
pub struct Entry {
    /// Name used in logs and listings.
    pub name: String,
    /// Priority band; higher wraps lower.
    pub priority: i32,
    /// Registration sequence number.
    pub order: u64,
    /// The middleware itself.
    pub middleware: Middleware,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Collects middlewares and installs them in priority order.
#[derive(Debug, Default)]
pub struct Registrar {
    entries: Vec<Entry>,
    counter: u64,
}

impl Registrar {
    /// Creates an empty registrar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `middleware` at `priority`.
    ///
    /// Passing `None` is a programming error and is reported as
    /// [`RegistrarError::MissingHandler`].
    pub fn register(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        middleware: impl Into<Option<Middleware>>,
    ) -> Result<&mut Self, RegistrarError> {
        let name = name.into();
        let Some(middleware) = middleware.into() else {
            return Err(RegistrarError::MissingHandler { name });
        };
        let order = self.counter;
        self.counter += 1;
        debug!(middleware = %name, priority, order, "middleware registered");
        self.entries.push(Entry {
            name,
            priority,
            order,
            middleware,
        });
        Ok(self)
    }

    /// Registers only when `condition` holds.
    pub fn register_if(
        &mut self,
        condition: bool,
        name: impl Into<String>,
        priority: i32,
        middleware: impl Into<Option<Middleware>>,
    ) -> Result<&mut Self, RegistrarError> {
        if condition {
            self.register(name, priority, middleware)
        } else {
            Ok(self)
        }
    }

    /// Registers a built-in middleware at its standard band.
    pub fn register_named(
        &mut self,
        name: MiddlewareName,
        middleware: impl Into<Option<Middleware>>,
    ) -> Result<&mut Self, RegistrarError> {
        self.register(name.as_str(), priority_of(name), middleware)
    }

    /// Entries in application order.
    pub fn list(&self) -> Vec<Entry> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
        sorted
    }

    /// Installs every entry on `router`, outermost first.
    ///
    /// Registrations are left untouched, so applying twice yields the same
    /// sequence of `use_middleware` calls.
    pub fn apply(&self, router: &mut dyn Router) {
        let sorted = self.list();
        for entry in &sorted {
            debug!(middleware = %entry.name, priority = entry.priority, "middleware applied");
            router.use_middleware(entry.middleware.clone());
        }
        debug!(count = sorted.len(), "middleware chain installed");
    }

    /// Number of registered middlewares.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Drops every registration.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.counter = 0;
    }
}
