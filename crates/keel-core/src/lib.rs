//! # Keel Core
//!
//! Foundational types shared by every keel crate:
//!
//! - [`Context`] - Per-request context: request view, typed values, response writer
//! - [`Handler`] / [`Middleware`] / [`Router`] - The routing contract
//! - [`KeelError`] / [`Errno`] - Error taxonomy and numeric codes
//! - [`Envelope`] - Uniform JSON response body, pooled
//! - [`Validate`] / [`FieldError`] - Structured validation

#![doc(html_root_url = "https://docs.rs/keel-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod context;
pub mod envelope;
pub mod errno;
mod error;
pub mod pool;
mod response;
mod router;
mod validate;

pub use context::{parse_ip, Context, Deadline, MatchedPath, RequestId};
pub use envelope::Envelope;
pub use errno::{Category, Errno, ErrnoError};
pub use error::{is_production, BoxError, KeelError, KeelResult};
pub use response::ResponseWriter;
pub use router::{
    chain, handler_fn, middleware_fn, BoxFuture, Handler, Middleware, RouteError, Router,
};
pub use validate::{join_field_errors, FieldError, Validate};
