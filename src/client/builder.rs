//! Builder pattern for client configuration.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use ws_duplex::{Client, Connection};
//!
//! # async fn example() -> ws_duplex::Result<()> {
//! let client = Client::builder("ws://127.0.0.1:9000/feed")
//!     .retry_interval(Duration::from_millis(500))
//!     .handler(|connection: Connection| async move {
//!         while let Some(payload) = connection.recv().await {
//!             println!("{} bytes", payload.len());
//!         }
//!     })
//!     .build()?;
//! # client.shutdown().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::transport::{ConnectionHandler, ConnectionOptions};

use super::core::Client;

// ============================================================================
// Constants
// ============================================================================

/// Wait between failed dial attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`Client`].
///
/// Use [`Client::builder()`] to create a new builder.
#[derive(Clone)]
pub struct ClientBuilder {
    /// Target URL.
    url: String,
    /// Callback for each established connection.
    handler: Option<Arc<dyn ConnectionHandler>>,
    /// Wait between failed dial attempts.
    retry_interval: Duration,
    /// Options for every dialled connection.
    options: ConnectionOptions,
}

// ============================================================================
// ClientBuilder Implementation
// ============================================================================

impl ClientBuilder {
    /// Creates a builder targeting `url`.
    #[inline]
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handler: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            options: ConnectionOptions::default(),
        }
    }

    /// Sets the connection handler.
    #[inline]
    #[must_use]
    pub fn handler(mut self, handler: impl ConnectionHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Sets the wait between failed dial attempts.
    #[inline]
    #[must_use]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the options applied to every dialled connection.
    #[inline]
    #[must_use]
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Validates the configuration and starts the supervisor task.
    ///
    /// Must be called from within a tokio runtime. Nothing is spawned when
    /// validation fails.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the URL is empty, malformed, or not `ws`/`wss`
    /// - [`Error::Config`] if no handler was set or the retry interval is zero
    pub fn build(self) -> Result<Client> {
        let url = self.validate_url()?;
        let handler = self.validate_handler()?;

        if self.retry_interval.is_zero() {
            return Err(Error::config("Retry interval must be greater than zero"));
        }

        Ok(Client::start(url, handler, self.retry_interval, self.options))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ClientBuilder {
    /// Validates the target URL.
    fn validate_url(&self) -> Result<String> {
        if self.url.is_empty() {
            return Err(Error::config("No URL provided"));
        }

        let parsed = Url::parse(&self.url)
            .map_err(|e| Error::config(format!("Invalid URL {:?}: {e}", self.url)))?;

        match parsed.scheme() {
            "ws" | "wss" => Ok(self.url.clone()),
            scheme => Err(Error::config(format!(
                "Unsupported URL scheme {scheme:?}, expected \"ws\" or \"wss\""
            ))),
        }
    }

    /// Validates the handler configuration.
    fn validate_handler(&self) -> Result<Arc<dyn ConnectionHandler>> {
        self.handler.clone().ok_or_else(|| {
            Error::config("Connection handler is required. Use .handler() to set it.")
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("url", &self.url)
            .field("handler", &self.handler.is_some())
            .field("retry_interval", &self.retry_interval)
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
