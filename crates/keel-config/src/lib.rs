//! # Keel Config
//!
//! Typed middleware options for the keel service chassis, with layered
//! loading and validated hot-reload.
//!
//! - [`Options`] holds one record per middleware plus the `enabled` list.
//! - [`ConfigLoader`] builds options from defaults, a TOML or JSON file, and
//!   `KEEL__SECTION__FIELD` environment overrides.
//! - [`ReloadableMiddleware`] swaps the live options atomically and notifies
//!   the middlewares that can change in place.
//! - [`ConfigWatcher`] drives reloads from file changes.
//!
//! # Example
//!
//! ```no_run
//! use keel_config::{ConfigLoader, ReloadableMiddleware};
//!
//! # fn main() -> Result<(), keel_config::ConfigError> {
//! let options = ConfigLoader::new()
//!     .with_optional_file("keel.toml")?
//!     .with_env_prefix("KEEL")
//!     .load()?;
//!
//! let live = ReloadableMiddleware::new(options);
//! assert!(live.get_options().timeout.timeout.as_millis() > 0);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File Format
//!
//! ```toml
//! enabled = ["recovery", "request-id", "logger", "cors", "timeout"]
//!
//! [cors]
//! allow-origins = ["https://example.com"]
//! allow-credentials = true
//! max-age = 3600
//!
//! [timeout]
//! timeout = "10s"
//! skip-paths = ["/health"]
//! ```

#![doc(html_root_url = "https://docs.rs/keel-config/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod duration;
mod error;
mod loader;
mod matcher;
mod name;
pub mod options;
mod reload;
mod watcher;

pub use duration::{ConfigDuration, ParseDurationError};
pub use error::{ConfigError, ReloadError};
pub use loader::ConfigLoader;
pub use matcher::{should_skip, PathMatcher};
pub use name::{MiddlewareName, UnknownMiddleware, DEFAULT_ENABLED};
pub use options::*;
pub use reload::{ChangeCallback, ReloadReport, ReloadableMiddleware};
pub use watcher::{ConfigWatcher, DEFAULT_DEBOUNCE};
