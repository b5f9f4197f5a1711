//! # Keel Server
//!
//! Transport side of the keel chassis:
//!
//! - [`HttpRouter`], a matchit-backed implementation of [`keel_core::Router`]
//!   with groups, static directories and mounted handlers
//! - route registrars for the health, metrics, version and profiling
//!   endpoints
//! - [`Server`], a hyper 1 server (HTTP/1.1 and HTTP/2) with graceful
//!   shutdown
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_core::{handler_fn, Context, Router};
//! use keel_server::{HttpRouter, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel_server::ServerError> {
//!     let mut router = HttpRouter::new();
//!     router.get("/hello", handler_fn(|ctx: Context| async move {
//!         ctx.success(&"world");
//!     }))?;
//!
//!     let handle = Server::new(ServerConfig::default(), router).start()?;
//!     println!("listening on {}", handle.local_addr());
//!     handle.wait().await
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/keel-server/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod error;
mod router;
pub mod routes;
mod server;
mod shutdown;
mod static_files;

pub use config::{ServerConfig, ServerConfigBuilder, DEFAULT_ADDR, DEFAULT_MAX_BODY_SIZE, DEFAULT_SHUTDOWN_TIMEOUT};
pub use error::{ServerError, ServerResult};
pub use router::HttpRouter;
pub use routes::{builtin_registrars, HealthChecks, VersionInfo};
pub use server::{HttpResponse, Server, ServerHandle};
pub use shutdown::{ConnectionToken, ConnectionTracker, ShutdownSignal};
