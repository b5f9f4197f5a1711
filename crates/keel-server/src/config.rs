//! Server configuration.
//!
//! ```
//! use keel_server::ServerConfig;
//! use std::time::Duration;
//!
//! let config = ServerConfig::builder()
//!     .addr("127.0.0.1:0")
//!     .shutdown_timeout(Duration::from_secs(5))
//!     .build();
//! assert_eq!(config.addr(), "127.0.0.1:0");
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::ServerError;

/// Default listen address.
pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";

/// Default time allowed for in-flight connections to finish on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest request body the transport buffers before handing the request to
/// the router. The body-limit middleware enforces the tighter per-route cap.
pub const DEFAULT_MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// Listener and connection settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    addr: String,
    shutdown_timeout: Duration,
    max_body_size: usize,
    http2: bool,
    tls_terminated: bool,
}

impl ServerConfig {
    /// Starts a builder with defaults.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Listen address as configured.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Resolves the listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        let invalid = |reason: String| ServerError::InvalidAddress {
            addr: self.addr.clone(),
            reason,
        };
        self.addr
            .to_socket_addrs()
            .map_err(|err| invalid(err.to_string()))?
            .next()
            .ok_or_else(|| invalid("resolved to no addresses".to_string()))
    }

    /// Graceful shutdown budget.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Transport-level body cap.
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Whether HTTP/2 is negotiated alongside HTTP/1.1.
    pub fn http2(&self) -> bool {
        self.http2
    }

    /// Whether requests arrive over TLS terminated in front of this process.
    pub fn tls_terminated(&self) -> bool {
        self.tls_terminated
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self {
            config: ServerConfig {
                addr: DEFAULT_ADDR.to_string(),
                shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
                max_body_size: DEFAULT_MAX_BODY_SIZE,
                http2: true,
                tls_terminated: false,
            },
        }
    }
}

impl ServerConfigBuilder {
    /// Sets the listen address (`host:port`).
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addr = addr.into();
        self
    }

    /// Sets the graceful shutdown budget.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Sets the transport-level body cap.
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.config.max_body_size = bytes;
        self
    }

    /// Enables or disables HTTP/2.
    pub fn http2(mut self, enabled: bool) -> Self {
        self.config.http2 = enabled;
        self
    }

    /// Marks every request as received over TLS.
    pub fn tls_terminated(mut self, tls: bool) -> Self {
        self.config.tls_terminated = tls;
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
