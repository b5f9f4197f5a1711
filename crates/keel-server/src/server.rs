//! HTTP server.
//!
//! Built on hyper 1 and tokio. [`Server::start`] binds the listener before it
//! returns, so address-in-use and permission errors reach the caller
//! directly; serving then continues on a spawned task controlled through the
//! returned [`ServerHandle`].
//!
//! ```rust,ignore
//! use keel_server::{HttpRouter, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel_server::ServerError> {
//!     let router = HttpRouter::new();
//!     let config = ServerConfig::builder().addr("0.0.0.0:8080").build();
//!     Server::new(config, router).run().await
//! }
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use keel_core::{Context, KeelError};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::routes::HealthChecks;
use crate::router::HttpRouter;
use crate::shutdown::{ConnectionTracker, ShutdownSignal};

/// Response type produced for every request.
pub type HttpResponse = Response<Full<Bytes>>;

/// The keel HTTP server.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    router: HttpRouter,
    health: Option<HealthChecks>,
}

impl Server {
    /// Creates a server that dispatches to `router`.
    pub fn new(config: ServerConfig, router: HttpRouter) -> Self {
        Self {
            config,
            router,
            health: None,
        }
    }

    /// Health state to flip to not-ready once shutdown begins.
    pub fn with_health(mut self, health: HealthChecks) -> Self {
        self.health = Some(health);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The root router.
    pub fn router(&self) -> &HttpRouter {
        &self.router
    }

    /// Binds the listener and starts serving on a spawned task.
    ///
    /// Returns once the socket is bound. Must be called inside a tokio
    /// runtime.
    pub fn start(self) -> ServerResult<ServerHandle> {
        let addr = self.config.socket_addr()?;
        let std_listener =
            std::net::TcpListener::bind(addr).map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, http2 = self.config.http2(), "server listening");

        let signal = ShutdownSignal::new();
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(self),
            signal.clone(),
        ));
        Ok(ServerHandle {
            local_addr,
            signal,
            task,
        })
    }

    /// Serves until SIGTERM or SIGINT, then drains connections.
    pub async fn run(self) -> ServerResult<()> {
        let handle = self.start()?;
        ShutdownSignal::with_os_signals().triggered().await;
        handle.shutdown().await
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr, signal: ShutdownSignal) {
        let io = TokioIo::new(stream);
        let server = Arc::clone(&self);
        let service = service_fn(move |req: Request<Incoming>| {
            let server = Arc::clone(&server);
            async move { Ok::<_, Infallible>(server.handle_request(req, remote).await) }
        });

        let mut builder = auto::Builder::new(TokioExecutor::new());
        if !self.config.http2() {
            builder = builder.http1_only();
        }
        let conn = builder.serve_connection(io, service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            () = signal.triggered() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(err) = result {
            debug!(%remote, error = %err, "connection closed with error");
        }
    }

    /// Collects the body, builds the [`Context`] and dispatches it.
    async fn handle_request(&self, req: Request<Incoming>, remote: SocketAddr) -> HttpResponse {
        let (parts, body) = req.into_parts();
        let limit = self.config.max_body_size();
        let tls = self.config.tls_terminated();

        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                let failure = if err.downcast_ref::<LengthLimitError>().is_some() {
                    KeelError::PayloadTooLarge { limit: limit as u64 }
                } else {
                    warn!(%remote, error = %err, "failed to read request body");
                    KeelError::invalid_request("failed to read request body")
                };
                let ctx = Context::from_request(Request::from_parts(parts, Bytes::new()), remote.to_string(), tls);
                ctx.error(&failure);
                return ctx.response().take_response();
            }
        };

        let ctx = Context::from_request(Request::from_parts(parts, body), remote.to_string(), tls);
        let writer = ctx.response().clone();
        self.router.dispatch(ctx).await;
        writer.take_response()
    }
}

async fn accept_loop(listener: TcpListener, server: Arc<Server>, signal: ShutdownSignal) {
    let tracker = ConnectionTracker::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let token = tracker.acquire();
                    let server = Arc::clone(&server);
                    let signal = signal.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, remote, signal).await;
                        drop(token);
                    });
                }
                Err(err) => error!(error = %err, "failed to accept connection"),
            },
            () = signal.triggered() => break,
        }
    }
    drop(listener);

    if let Some(health) = &server.health {
        health.set_ready(false);
    }
    let budget = server.config.shutdown_timeout();
    info!(
        active = tracker.active_connections(),
        timeout_ms = budget.as_millis() as u64,
        "shutdown started, draining connections"
    );
    if tokio::time::timeout(budget, tracker.wait_idle()).await.is_err() {
        warn!(
            active = tracker.active_connections(),
            "shutdown timeout reached with connections still open"
        );
    }
    info!("server stopped");
}

/// Control handle for a started server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    signal: ShutdownSignal,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The signal that stops this server.
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Stops accepting, drains open connections and waits for the server
    /// task to finish.
    pub async fn shutdown(self) -> ServerResult<()> {
        self.signal.trigger();
        self.wait().await
    }

    /// Waits for the server task to finish without triggering shutdown.
    pub async fn wait(self) -> ServerResult<()> {
        self.task
            .await
            .map_err(|err| ServerError::Task(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use keel_core::{handler_fn, Router};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        String::from_utf8_lossy(&response).into_owned()
    }

    fn echo_router() -> HttpRouter {
        let mut router = HttpRouter::new();
        router
            .post(
                "/echo",
                handler_fn(|ctx: Context| async move {
                    let body = ctx.body().clone();
                    ctx.bytes(StatusCode::OK, "text/plain", body);
                }),
            )
            .unwrap();
        router
    }

    fn local() -> ServerConfig {
        ServerConfig::builder().addr("127.0.0.1:0").build()
    }

    #[tokio::test]
    async fn test_start_binds_before_returning() {
        let handle = Server::new(local(), echo_router()).start().unwrap();
        assert_ne!(handle.local_addr().port(), 0);

        let response = raw_request(
            handle.local_addr(),
            "POST /echo HTTP/1.1\r\nHost: test\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("hello"));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_returned() {
        let first = Server::new(local(), HttpRouter::new()).start().unwrap();
        let taken = ServerConfig::builder()
            .addr(first.local_addr().to_string())
            .build();
        let err = Server::new(taken, HttpRouter::new()).start().unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        first.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_route_is_404_envelope() {
        let handle = Server::new(local(), HttpRouter::new()).start().unwrap();
        let response = raw_request(
            handle.local_addr(),
            "GET /nowhere HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(response.contains("\"http_code\":404"));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let config = ServerConfig::builder()
            .addr("127.0.0.1:0")
            .max_body_size(4)
            .build();
        let handle = Server::new(config, echo_router()).start().unwrap();
        let response = raw_request(
            handle.local_addr(),
            "POST /echo HTTP/1.1\r\nHost: test\r\nContent-Length: 10\r\nConnection: close\r\n\r\n0123456789",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 413"));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_marks_not_ready() {
        let health = HealthChecks::new();
        let handle = Server::new(local(), HttpRouter::new())
            .with_health(health.clone())
            .start()
            .unwrap();
        assert!(health.is_ready());
        handle.shutdown().await.unwrap();
        assert!(!health.is_ready());
    }
}
