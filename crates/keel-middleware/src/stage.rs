//! The trait every built-in middleware implements.

use std::sync::Arc;

use keel_core::{BoxFuture, Context, Handler, Middleware};

/// A middleware stage with shared state.
///
/// A stage receives the request context and the next handler, and must
/// either call `next` exactly once or write a response itself and return.
///
/// ```ignore
/// struct Hello;
///
/// impl Stage for Hello {
///     fn name(&self) -> &'static str {
///         "hello"
///     }
///
///     fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
///         Box::pin(async move {
///             ctx.set_header("x-hello", "world");
///             next(ctx).await;
///         })
///     }
/// }
/// ```
pub trait Stage: Send + Sync + 'static {
    /// Stage name for logs.
    fn name(&self) -> &'static str;

    /// Processes one request.
    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()>;

    /// Converts the stage into a chain [`Middleware`].
    fn into_middleware(self) -> Middleware
    where
        Self: Sized,
    {
        let stage = Arc::new(self);
        Arc::new(move |next: Handler| -> Handler {
            let stage = Arc::clone(&stage);
            Arc::new(move |ctx: Context| Arc::clone(&stage).handle(ctx, next.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;
    use keel_core::{chain, handler_fn};

    struct Stamp;

    impl Stage for Stamp {
        fn name(&self) -> &'static str {
            "stamp"
        }

        fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
            Box::pin(async move {
                ctx.set_header("x-stamp", self.name());
                next(ctx).await;
            })
        }
    }

    #[tokio::test]
    async fn test_stage_as_middleware() {
        let endpoint = handler_fn(|ctx: Context| async move {
            ctx.string(StatusCode::OK, "ok");
        });
        let handler = chain(&[Stamp.into_middleware()], endpoint);
        let ctx = Context::new(http::Request::new(Bytes::new()));
        let writer = ctx.response().clone();
        handler(ctx).await;

        assert_eq!(writer.header("x-stamp").unwrap(), "stamp");
        assert_eq!(writer.body(), "ok");
    }
}
