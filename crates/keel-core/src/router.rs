//! Handler, middleware and router contracts.
//!
//! The chassis never owns a routing engine. It speaks to one through the
//! [`Router`] trait, and composes behaviour with two function types:
//!
//! - [`Handler`]: `Context -> future`, writes its response through the context
//! - [`Middleware`]: `Handler -> Handler`
//!
//! [`chain`] composes a middleware list so that the first element is the
//! outermost wrapper.
//!
//! ```ignore
//! router.use_middleware(request_id);
//! router.handle(Method::GET, "/users/{id}", handler_fn(|ctx| async move {
//!     let id = ctx.param("id").unwrap_or_default().to_string();
//!     ctx.success(&serde_json::json!({ "id": id }));
//! }))?;
//! ```

use crate::context::Context;
use http::Method;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// A boxed future that is `Send`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request handler.
pub type Handler = Arc<dyn Fn(Context) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler transformer.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Wraps a closure as a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> Middleware
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Composes `middlewares` around `endpoint`; the first middleware runs first.
pub fn chain(middlewares: &[Middleware], endpoint: Handler) -> Handler {
    middlewares
        .iter()
        .rev()
        .fold(endpoint, |next, middleware| middleware(next))
}

/// Errors returned while registering routes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// The path pattern is malformed.
    #[error("invalid route '{path}': {reason}")]
    InvalidPath {
        /// Offending pattern.
        path: String,
        /// Parser message.
        reason: String,
    },

    /// The same method and pattern are already registered.
    #[error("route conflict: {method} {path}")]
    Conflict {
        /// Method.
        method: String,
        /// Pattern.
        path: String,
    },

    /// A static root directory is unusable.
    #[error("invalid static root '{root}': {reason}")]
    InvalidRoot {
        /// Directory.
        root: String,
        /// Reason.
        reason: String,
    },
}

/// Contract every routing engine adapter implements.
///
/// Middlewares are captured when a route is registered: routes added before a
/// [`use_middleware`](Router::use_middleware) call do not see it, and a group
/// inherits the middlewares its parent had at the time of the
/// [`group`](Router::group) call.
pub trait Router: Send + Sync {
    /// Registers `handler` for `method` and `path`.
    fn handle(&mut self, method: Method, path: &str, handler: Handler) -> Result<(), RouteError>;

    /// Creates a sub-router whose routes are prefixed with `prefix`.
    fn group(&self, prefix: &str) -> Box<dyn Router>;

    /// Appends a middleware to this router's chain.
    fn use_middleware(&mut self, middleware: Middleware);

    /// Serves files under `root` at `prefix`.
    fn static_files(&mut self, prefix: &str, root: &Path) -> Result<(), RouteError>;

    /// Routes every method and sub-path under `prefix` to `handler`.
    fn mount(&mut self, prefix: &str, handler: Handler) -> Result<(), RouteError>;

    /// Appends several middlewares in order.
    fn use_middlewares(&mut self, middlewares: Vec<Middleware>) {
        for middleware in middlewares {
            self.use_middleware(middleware);
        }
    }

    /// Registers a GET route.
    fn get(&mut self, path: &str, handler: Handler) -> Result<(), RouteError> {
        self.handle(Method::GET, path, handler)
    }

    /// Registers a POST route.
    fn post(&mut self, path: &str, handler: Handler) -> Result<(), RouteError> {
        self.handle(Method::POST, path, handler)
    }

    /// Registers a PUT route.
    fn put(&mut self, path: &str, handler: Handler) -> Result<(), RouteError> {
        self.handle(Method::PUT, path, handler)
    }

    /// Registers a DELETE route.
    fn delete(&mut self, path: &str, handler: Handler) -> Result<(), RouteError> {
        self.handle(Method::DELETE, path, handler)
    }

    /// Registers a PATCH route.
    fn patch(&mut self, path: &str, handler: Handler) -> Result<(), RouteError> {
        self.handle(Method::PATCH, path, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderValue, StatusCode};

    fn tag(name: &'static str) -> Middleware {
        middleware_fn(move |next: Handler| {
            handler_fn(move |ctx: Context| {
                let next = next.clone();
                async move {
                    ctx.response().append_header(
                        http::header::HeaderName::from_static("x-order"),
                        HeaderValue::from_static(name),
                    );
                    next(ctx).await;
                }
            })
        })
    }

    #[tokio::test]
    async fn test_chain_first_is_outermost() {
        let endpoint = handler_fn(|ctx: Context| async move {
            ctx.string(StatusCode::OK, "done");
        });
        let handler = chain(&[tag("a"), tag("b"), tag("c")], endpoint);
        let ctx = Context::new(http::Request::new(Bytes::new()));
        let writer = ctx.response().clone();
        handler(ctx).await;

        let response = writer.take_response();
        let order: Vec<_> = response
            .headers()
            .get_all("x-order")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_empty_chain_is_endpoint() {
        let endpoint = handler_fn(|ctx: Context| async move {
            ctx.string(StatusCode::ACCEPTED, "x");
        });
        let handler = chain(&[], endpoint);
        let ctx = Context::new(http::Request::new(Bytes::new()));
        let writer = ctx.response().clone();
        handler(ctx).await;
        assert_eq!(writer.status(), StatusCode::ACCEPTED);
    }
}
