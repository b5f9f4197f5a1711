//! Request routing.
//!
//! [`HttpRouter`] is the chassis' own implementation of the
//! [`keel_core::Router`] contract, backed by one [`matchit`] radix tree per
//! method plus a method-agnostic tree for mounted handlers.
//!
//! Middlewares are captured when a route is registered. The router composes
//! the chain once at registration time and stores the finished handler, so a
//! request only pays for the lookup.
//!
//! Patterns use `{name}` for a segment parameter and `{*name}` for a
//! catch-all. The `:name` and `*name` spellings are accepted and rewritten.
//!
//! # Example
//!
//! ```
//! use keel_core::{handler_fn, Context, Router};
//! use keel_server::HttpRouter;
//! use http::StatusCode;
//!
//! let mut router = HttpRouter::new();
//! router
//!     .get("/users/{id}", handler_fn(|ctx: Context| async move {
//!         let id = ctx.param("id").unwrap_or_default().to_string();
//!         ctx.string(StatusCode::OK, id);
//!     }))
//!     .unwrap();
//! assert!(router.has_route(&http::Method::GET, "/users/{id}"));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use http::Method;
use keel_core::{
    chain, handler_fn, Context, Handler, KeelError, MatchedPath, Middleware, RouteError, Router,
};
use parking_lot::RwLock;
use tracing::debug;

use crate::static_files::StaticDir;

#[derive(Clone)]
struct Endpoint {
    pattern: String,
    handler: Handler,
}

#[derive(Default)]
struct Table {
    by_method: HashMap<Method, matchit::Router<Endpoint>>,
    mounts: matchit::Router<Endpoint>,
    patterns: Vec<(Method, String)>,
}

/// A resolved route: the composed handler, its pattern and the captured
/// parameters.
struct Resolved {
    endpoint: Endpoint,
    params: Vec<(String, String)>,
}

impl Table {
    fn insert(&mut self, method: Method, pattern: &str, endpoint: Endpoint) -> Result<(), RouteError> {
        let tree = self.by_method.entry(method.clone()).or_default();
        tree.insert(pattern, endpoint)
            .map_err(|err| insert_error(method.as_str(), pattern, &err))?;
        self.patterns.push((method, pattern.to_string()));
        Ok(())
    }

    fn insert_mount(&mut self, pattern: &str, endpoint: Endpoint) -> Result<(), RouteError> {
        self.mounts
            .insert(pattern, endpoint)
            .map_err(|err| insert_error("ANY", pattern, &err))
    }

    fn resolve(&self, method: &Method, path: &str) -> Option<Resolved> {
        let lookup = |tree: &matchit::Router<Endpoint>| {
            tree.at(path).ok().map(|found| Resolved {
                endpoint: found.value.clone(),
                params: found
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            })
        };

        if let Some(resolved) = self.by_method.get(method).and_then(lookup) {
            return Some(resolved);
        }
        if *method == Method::HEAD {
            if let Some(resolved) = self.by_method.get(&Method::GET).and_then(lookup) {
                return Some(resolved);
            }
        }
        lookup(&self.mounts)
    }
}

fn insert_error(method: &str, pattern: &str, err: &matchit::InsertError) -> RouteError {
    match err {
        matchit::InsertError::Conflict { .. } => RouteError::Conflict {
            method: method.to_string(),
            path: pattern.to_string(),
        },
        other => RouteError::InvalidPath {
            path: pattern.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Joins a group prefix and a route path into a normalized pattern.
pub(crate) fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => prefix.to_string(),
        (_, false) => format!("{prefix}/{path}"),
    }
}

/// Rewrites `:name` and `*name` segments into matchit syntax.
fn normalize(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{name}}}")
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn validate(path: &str) -> Result<(), RouteError> {
    if !path.is_empty() && !path.starts_with('/') {
        return Err(RouteError::InvalidPath {
            path: path.to_string(),
            reason: "must start with '/'".to_string(),
        });
    }
    Ok(())
}

/// The router: matchit trees shared by a root and all of its groups.
#[derive(Clone, Default)]
pub struct HttpRouter {
    prefix: String,
    middlewares: Vec<Middleware>,
    table: Arc<RwLock<Table>>,
}

impl fmt::Debug for HttpRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRouter")
            .field("prefix", &self.prefix)
            .field("middlewares", &self.middlewares.len())
            .field("routes", &self.table.read().patterns.len())
            .finish()
    }
}

impl HttpRouter {
    /// Creates an empty root router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix of this router (empty for the root).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of middlewares captured by this router so far.
    pub fn middleware_count(&self) -> usize {
        self.middlewares.len()
    }

    /// Registered `(method, pattern)` pairs, in registration order.
    pub fn routes(&self) -> Vec<(Method, String)> {
        self.table.read().patterns.clone()
    }

    /// True when `pattern` is registered for `method`.
    pub fn has_route(&self, method: &Method, pattern: &str) -> bool {
        self.table
            .read()
            .patterns
            .iter()
            .any(|(m, p)| m == method && p == pattern)
    }

    /// Routes `ctx` to its handler.
    ///
    /// Path parameters and the [`MatchedPath`] are attached before the route's
    /// middleware chain runs. Unknown routes run this router's middlewares
    /// around a `404` answer so the usual envelope and headers are produced.
    pub async fn dispatch(&self, ctx: Context) {
        let resolved = self.table.read().resolve(ctx.method(), ctx.path());
        match resolved {
            Some(Resolved { endpoint, params }) => {
                let ctx = ctx
                    .with_params(params)
                    .with_value(MatchedPath(endpoint.pattern));
                (endpoint.handler)(ctx).await;
            }
            None => {
                debug!(method = %ctx.method(), path = %ctx.path(), "no route matched");
                chain(&self.middlewares, not_found())(ctx).await;
            }
        }
    }

    /// The router as a single handler.
    pub fn into_handler(self) -> Handler {
        let router = Arc::new(self);
        handler_fn(move |ctx: Context| {
            let router = Arc::clone(&router);
            async move { router.dispatch(ctx).await }
        })
    }

    fn endpoint(&self, pattern: String, handler: Handler) -> Endpoint {
        Endpoint {
            pattern,
            handler: chain(&self.middlewares, handler),
        }
    }
}

fn not_found() -> Handler {
    handler_fn(|ctx: Context| async move {
        let err = KeelError::RouteNotFound {
            method: ctx.method().to_string(),
            path: ctx.path().to_string(),
        };
        ctx.error(&err);
    })
}

impl Router for HttpRouter {
    fn handle(&mut self, method: Method, path: &str, handler: Handler) -> Result<(), RouteError> {
        validate(path)?;
        let pattern = normalize(&join_path(&self.prefix, path));
        let endpoint = self.endpoint(pattern.clone(), handler);
        self.table.write().insert(method.clone(), &pattern, endpoint)?;
        debug!(%method, %pattern, middlewares = self.middlewares.len(), "route registered");
        Ok(())
    }

    fn group(&self, prefix: &str) -> Box<dyn Router> {
        Box::new(Self {
            prefix: join_path(&self.prefix, prefix),
            middlewares: self.middlewares.clone(),
            table: Arc::clone(&self.table),
        })
    }

    fn use_middleware(&mut self, middleware: Middleware) {
        self.middlewares.push(middleware);
    }

    fn static_files(&mut self, prefix: &str, root: &Path) -> Result<(), RouteError> {
        validate(prefix)?;
        let dir = StaticDir::open(root)?;
        let handler = dir.into_handler();
        let base = join_path(&self.prefix, prefix);
        let wildcard = join_path(&base, "{*filepath}");
        for method in [Method::GET, Method::HEAD] {
            let mut table = self.table.write();
            table.insert(method.clone(), &base, self.endpoint(base.clone(), handler.clone()))?;
            table.insert(method, &wildcard, self.endpoint(wildcard.clone(), handler.clone()))?;
        }
        debug!(prefix = %base, root = %root.display(), "static directory registered");
        Ok(())
    }

    fn mount(&mut self, prefix: &str, handler: Handler) -> Result<(), RouteError> {
        validate(prefix)?;
        let base = join_path(&self.prefix, prefix);
        let wildcard = join_path(&base, "{*rest}");
        let tail = join_path(&base, "*");
        let mut table = self.table.write();
        table.insert_mount(&base, self.endpoint(base.clone(), handler.clone()))?;
        table.insert_mount(&wildcard, self.endpoint(tail, handler))?;
        debug!(prefix = %base, "handler mounted");
        Ok(())
    }
}
