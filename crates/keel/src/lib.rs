//! # Keel
//!
//! HTTP service chassis. A service is assembled from one options tree:
//!
//! - middlewares are built by name, ordered by priority band and installed
//!   on the router before any business route
//! - health, metrics, version and profiling endpoints are registered when
//!   enabled
//! - option changes are applied at runtime without rebuilding the chain
//!
//! The component crates are re-exported as modules:
//!
//! | Module | Crate | Contents |
//! |--------|-------|----------|
//! | [`core`] | `keel-core` | context, router trait, errno, envelope |
//! | [`config`] | `keel-config` | options, loader, hot reload, watcher |
//! | [`telemetry`] | `keel-telemetry` | logging, metrics, tracing setup |
//! | [`middleware`] | `keel-middleware` | stages, factories, registrar |
//! | [`server`] | `keel-server` | router, endpoints, hyper server |
//! | [`checkpoint`] | `keel-checkpoint` | session state stores |
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = Options::default().with_cors(CorsOptions::default());
//!     let service = Chassis::new(options).build()?;
//!
//!     let mut router = service.router();
//!     router.get("/hello", handler_fn(|ctx: Context| async move {
//!         ctx.success(&"world");
//!     }))?;
//!
//!     let handle = service.start()?;
//!     handle.wait().await?;
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/keel/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod chassis;
mod error;

pub use keel_checkpoint as checkpoint;
pub use keel_config as config;
pub use keel_core as core;
pub use keel_middleware as middleware;
pub use keel_server as server;
pub use keel_telemetry as telemetry;

pub use chassis::{Chassis, Service};
pub use error::{ChassisError, ChassisResult};

/// Common imports for building a service.
pub mod prelude {
    pub use crate::{Chassis, ChassisError, ChassisResult, Service};
    pub use keel_config::{
        ConfigDuration, ConfigLoader, CorsOptions, MiddlewareName, Options, RateLimitOptions,
        ReloadableMiddleware, TimeoutOptions,
    };
    pub use keel_core::{handler_fn, middleware_fn, Context, Handler, KeelError, Middleware, Router};
    pub use keel_server::{HealthChecks, HttpRouter, ServerConfig, VersionInfo};
}
