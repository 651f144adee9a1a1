//! Registry of accepted connections.
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │        ConnectionRegistry          │
//! │  ┌──────────────────────────────┐  │
//! │  │ key-a → Connection           │  │
//! │  │ key-b → Connection           │  │
//! │  └──────────────────────────────┘  │
//! │  entries are evicted on close      │
//! └────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::transport::{Connection, ConnectionHandler, ConnectionOptions, Endpoint};

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Stores accepted connections by key and runs the handler for each.
///
/// Cheap to clone; clones share the same map. Every registry is an
/// independent instance.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// Active connections by key. One lock covers every operation.
    connections: Mutex<FxHashMap<String, Connection>>,
    /// Callback for each accepted connection.
    handler: Option<Arc<dyn ConnectionHandler>>,
    /// Options for every accepted connection.
    options: ConnectionOptions,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ConnectionRegistry - Constructors
// ============================================================================

impl ConnectionRegistry {
    /// Creates an empty registry without a handler.
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(None, ConnectionOptions::default())
    }

    /// Creates an empty registry that runs `handler` for each connection.
    #[must_use]
    pub fn with_handler(handler: impl ConnectionHandler + 'static) -> Self {
        Self::from_parts(Some(Arc::new(handler)), ConnectionOptions::default())
    }

    pub(crate) fn from_parts(
        handler: Option<Arc<dyn ConnectionHandler>>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: Mutex::new(FxHashMap::default()),
                handler,
                options,
            }),
        }
    }
}

// ============================================================================
// ConnectionRegistry - Public API
// ============================================================================

impl ConnectionRegistry {
    /// Wraps an upgraded transport, registers it under `key` and awaits the
    /// handler.
    ///
    /// An existing entry under the same key is replaced; keys must be unique.
    /// The entry is removed again when the connection closes.
    pub async fn accept_transport<S>(
        &self,
        key: impl Into<String>,
        ws_stream: WebSocketStream<S>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Endpoint + Unpin + Send + 'static,
    {
        let connection = self.register(key, ws_stream);
        self.run_handler(connection.clone()).await;
        connection
    }

    /// Wraps and registers a transport without running the handler.
    pub(crate) fn register<S>(
        &self,
        key: impl Into<String>,
        ws_stream: WebSocketStream<S>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Endpoint + Unpin + Send + 'static,
    {
        let key = key.into();
        let connection = Connection::with_options(key.clone(), ws_stream, self.inner.options);

        let replaced = self
            .inner
            .connections
            .lock()
            .insert(key.clone(), connection.clone());
        if replaced.is_some() {
            warn!(key = %key, "Connection key reused, previous entry replaced");
        }

        info!(key = %key, remote = ?connection.remote_addr(), "Connection registered");

        self.evict_on_close(key, connection.clone());

        connection
    }

    /// Awaits the handler for `connection`, if one is configured.
    pub(crate) async fn run_handler(&self, connection: Connection) {
        if let Some(handler) = &self.inner.handler {
            handler.on_connection(connection).await;
        }
    }

    /// Returns the connection registered under `key`.
    #[must_use]
    pub fn connection(&self, key: &str) -> Option<Connection> {
        self.inner.connections.lock().get(key).cloned()
    }

    /// Returns a snapshot of all registered connections.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections.lock().values().cloned().collect()
    }

    /// Returns the number of registered connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Returns `true` if no connection is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.connections.lock().is_empty()
    }

    /// Removes the connection under `key` and closes it.
    pub fn remove(&self, key: &str) -> Option<Connection> {
        let removed = self.inner.connections.lock().remove(key);

        if let Some(connection) = &removed {
            connection.close();
            debug!(key = %key, "Connection removed from registry");
        }

        removed
    }

    /// Removes and closes every registered connection.
    pub fn close_all(&self) {
        let connections: Vec<_> = self.inner.connections.lock().drain().collect();

        for (key, connection) in connections {
            connection.close();
            debug!(key = %key, "Connection closed during shutdown");
        }
    }
}

// ============================================================================
// ConnectionRegistry - Eviction
// ============================================================================

impl ConnectionRegistry {
    /// Removes `key` once `connection` has closed.
    ///
    /// Holds only a weak reference, so a dropped registry is not kept alive.
    fn evict_on_close(&self, key: String, connection: Connection) {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            connection.closed().await;

            if let Some(inner) = registry.upgrade() {
                inner.evict(&key, &connection);
            }
        });
    }
}

impl RegistryInner {
    /// Removes `key` only if it still maps to `connection`.
    fn evict(&self, key: &str, connection: &Connection) {
        let mut connections = self.connections.lock();

        let current = connections
            .get(key)
            .is_some_and(|entry| entry.same_connection(connection));
        if current {
            connections.remove(key);
            debug!(key = %key, "Closed connection evicted");
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .field("handler", &self.inner.handler.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
