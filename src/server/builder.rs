//! Builder pattern for server configuration.
//!
//! # Example
//!
//! ```no_run
//! use ws_duplex::{Connection, Server};
//!
//! # async fn example() -> ws_duplex::Result<()> {
//! let server = Server::builder()
//!     .port(9000)
//!     .handler(|connection: Connection| async move {
//!         while let Some(payload) = connection.recv().await {
//!             let _ = connection.send(payload);
//!         }
//!     })
//!     .bind()
//!     .await?;
//!
//! println!("listening on {}", server.ws_url());
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::{ConnectionHandler, ConnectionOptions};

use super::core::Server;
use super::registry::ConnectionRegistry;

// ============================================================================
// Constants
// ============================================================================

/// Default bind address (localhost).
const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default time allowed for a request head to arrive.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ServerBuilder
// ============================================================================

/// Builder for configuring a [`Server`].
///
/// Use [`Server::builder()`] to create a new builder.
#[derive(Clone)]
pub struct ServerBuilder {
    /// Address to bind.
    addr: SocketAddr,
    /// Callback for each accepted connection.
    handler: Option<Arc<dyn ConnectionHandler>>,
    /// Options for every accepted connection.
    options: ConnectionOptions,
    /// Time allowed for a request head to arrive.
    handshake_timeout: Duration,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ServerBuilder Implementation
// ============================================================================

impl ServerBuilder {
    /// Creates a builder bound to `127.0.0.1` on a random port.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            addr: SocketAddr::new(DEFAULT_BIND_IP, 0),
            handler: None,
            options: ConnectionOptions::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Sets the full bind address.
    #[inline]
    #[must_use]
    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the bind IP, keeping the port.
    #[inline]
    #[must_use]
    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.addr.set_ip(ip);
        self
    }

    /// Sets the bind port (0 for random), keeping the IP.
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    /// Sets the connection handler.
    #[inline]
    #[must_use]
    pub fn handler(mut self, handler: impl ConnectionHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Sets the options applied to every accepted connection.
    #[inline]
    #[must_use]
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the time allowed for a request head to arrive.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Binds the listener and starts the accept loop.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the handshake timeout is zero
    /// - [`Error::Io`] if binding fails
    pub async fn bind(self) -> Result<Server> {
        if self.handshake_timeout.is_zero() {
            return Err(Error::config("Handshake timeout must be greater than zero"));
        }

        let registry = ConnectionRegistry::from_parts(self.handler, self.options);
        Server::start(self.addr, registry, self.handshake_timeout).await
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("addr", &self.addr)
            .field("handler", &self.handler.is_some())
            .field("options", &self.options)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let builder = ServerBuilder::new();
        assert_eq!(builder.addr, SocketAddr::new(DEFAULT_BIND_IP, 0));
        assert!(builder.handler.is_none());
        assert_eq!(builder.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn test_ip_and_port_compose() {
        let builder = ServerBuilder::new()
            .ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .port(9000);
        assert_eq!(builder.addr, "0.0.0.0:9000".parse::<SocketAddr>().expect("addr"));
    }

    #[tokio::test]
    async fn test_zero_handshake_timeout_is_config_error() {
        let err = ServerBuilder::new()
            .handshake_timeout(Duration::ZERO)
            .bind()
            .await
            .unwrap_err();
        assert!(err.is_config_error());
    }
}
