//! # Keel Middleware
//!
//! Ordered middleware installation and the built-in middleware stages.
//!
//! A service never wires middlewares by hand. It describes them in
//! [`keel_config::Options`], turns each enabled record into a [`Middleware`]
//! through a [`MiddlewareFactory`], and lets the [`Registrar`] install the
//! result on a router in priority order:
//!
//! ```text
//! Options ──▶ FactoryRegistry ──▶ Registrar ──▶ Router::use_middleware
//!                   │
//!                   └──▶ RouteRegistrar ──▶ Router::handle (health, metrics, ...)
//! ```
//!
//! ## Priority bands
//!
//! Higher priorities wrap lower ones, so recovery sees every panic and the
//! request id exists before the logger runs.
//!
//! | Priority | Stage            |
//! |----------|------------------|
//! | 1000     | recovery         |
//! | 900      | request-id       |
//! | 800      | logger           |
//! | 700      | metrics          |
//! | 650      | tracing          |
//! | 600      | cors             |
//! | 560      | rate-limit       |
//! | 550      | body-limit       |
//! | 540      | security-headers |
//! | 500      | timeout          |
//! | 450      | circuit-breaker  |
//! | 400      | auth             |
//! | 300      | authz            |
//! | 200      | compression      |
//! | 100      | custom           |
//!
//! ## Example
//!
//! ```
//! use keel_config::MiddlewareName;
//! use keel_middleware::{priority, Registrar};
//! use keel_middleware::stages::RequestIdStage;
//! use keel_middleware::Stage;
//!
//! let mut registrar = Registrar::new();
//! registrar
//!     .register_named(MiddlewareName::RequestId, RequestIdStage::default().into_middleware())
//!     .unwrap();
//! assert_eq!(registrar.list()[0].priority, priority::REQUEST_ID);
//! ```

#![doc(html_root_url = "https://docs.rs/keel-middleware/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
pub mod factory;
pub mod priority;
pub mod ratelimit;
mod registrar;
mod stage;
pub mod stages;

pub use error::{FactoryError, LimiterError, RegistrarError};
pub use factory::{
    record_for, validate_config, AnyConfig, FactoryRegistry, MiddlewareFactory, RouteRegistrar,
};
pub use keel_core::{Handler, Middleware};
pub use ratelimit::{Limiter, MemoryLimiter, RedisLimiter, ReloadableLimiter};
pub use registrar::{Entry, Registrar};
pub use stage::Stage;
