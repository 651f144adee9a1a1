//! WebSocket accept surface.
//!
//! # Connection Flow
//!
//! 1. The accept loop takes a TCP stream and spawns a task for it
//! 2. The opening handshake runs; requests that cannot be upgraded get an
//!    HTTP error status
//! 3. A UUID key is generated and the connection is registered
//! 4. The registry runs the handler
//!
//! Shutdown waits for handshakes in flight, so nothing is registered after
//! [`Server::shutdown`] returns.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::Connection;

use super::builder::ServerBuilder;
use super::registry::ConnectionRegistry;
use super::upgrade;

// ============================================================================
// Server
// ============================================================================

/// WebSocket server that registers every accepted connection.
///
/// # Example
///
/// ```ignore
/// let server = Server::bind("127.0.0.1:0".parse()?).await?;
/// println!("WebSocket URL: {}", server.ws_url());
///
/// for connection in server.registry().connections() {
///     let _ = connection.send("broadcast");
/// }
///
/// server.shutdown().await;
/// ```
pub struct Server {
    /// Address the listener is bound to.
    local_addr: SocketAddr,
    /// Accepted connections.
    registry: ConnectionRegistry,
    /// Stops the accept loop and pending handshakes.
    cancel: CancellationToken,
    /// Handshakes that have not registered their connection yet.
    handshakes: TaskTracker,
    /// Accept loop task, taken by `shutdown`.
    task: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// Server - Constructor
// ============================================================================

impl Server {
    /// Creates a builder for a server.
    #[inline]
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Binds a server without a handler at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        ServerBuilder::new().addr(addr).bind().await
    }

    /// Binds the listener and spawns the accept loop.
    pub(crate) async fn start(
        addr: SocketAddr,
        registry: ConnectionRegistry,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let handshakes = TaskTracker::new();

        let acceptor = Acceptor {
            registry: registry.clone(),
            cancel: cancel.clone(),
            handshakes: handshakes.clone(),
            handshake_timeout,
        };
        let task = tokio::spawn(acceptor.run(listener));

        info!(%local_addr, "WebSocket server started");

        Ok(Self {
            local_addr,
            registry,
            cancel,
            handshakes,
            task: Mutex::new(Some(task)),
        })
    }
}

// ============================================================================
// Server - Public API
// ============================================================================

impl Server {
    /// Returns the address the server is bound to.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL for this server.
    ///
    /// Format: `ws://{ip}:{port}`
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Returns the registry of accepted connections.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Stops accepting and closes every registered connection.
    pub async fn shutdown(&self) {
        info!(local_addr = %self.local_addr, "WebSocket server shutting down");

        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(error = %e, "Accept loop failed");
        }

        self.handshakes.close();
        self.handshakes.wait().await;

        self.registry.close_all();

        info!("WebSocket server shutdown complete");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("registry", &self.registry)
            .finish()
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

/// State owned by the accept loop.
struct Acceptor {
    registry: ConnectionRegistry,
    cancel: CancellationToken,
    handshakes: TaskTracker,
    handshake_timeout: Duration,
}

impl Acceptor {
    /// Accepts TCP streams until cancelled.
    async fn run(self, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            let accepted = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let registry = self.registry.clone();
                    let cancel = self.cancel.clone();
                    let registering = self.handshakes.track_future(Self::register_stream(
                        registry.clone(),
                        stream,
                        addr,
                        self.handshake_timeout,
                        cancel,
                    ));

                    tokio::spawn(async move {
                        match registering.await {
                            Ok(connection) => registry.run_handler(connection).await,
                            Err(e) => warn!(error = %e, ?addr, "Connection handling failed"),
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                }
            }
        }

        debug!("Accept loop terminated");
    }

    /// Upgrades one TCP stream and registers it under a fresh key.
    async fn register_stream(
        registry: ConnectionRegistry,
        stream: TcpStream,
        addr: SocketAddr,
        handshake_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Connection> {
        debug!(?addr, "New TCP connection");

        let ws_stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::upgrade("Server shutting down")),
            upgraded = upgrade::accept(stream, handshake_timeout) => upgraded?,
        };

        if cancel.is_cancelled() {
            return Err(Error::upgrade("Server shutting down"));
        }

        let key = Uuid::new_v4().to_string();
        info!(key = %key, ?addr, "WebSocket connection established");

        Ok(registry.register(key, ws_stream))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    use crate::transport::testing::init_tracing;

    const WAIT: Duration = Duration::from_secs(5);

    async fn wait_for_connections(server: &Server, count: usize) -> Vec<Connection> {
        timeout(WAIT, async {
            loop {
                let connections = server.registry().connections();
                if connections.len() == count {
                    return connections;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connections registered in time")
    }

    #[tokio::test]
    async fn test_bind_random_port() {
        init_tracing();
        let server = Server::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind should succeed");

        assert!(server.local_addr().port() > 0);
        assert_eq!(server.ws_url(), format!("ws://127.0.0.1:{}", server.local_addr().port()));
        assert!(server.registry().is_empty());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_receive() {
        init_tracing();
        let server = Server::builder().bind().await.expect("bind");
        let (mut client, _) = connect_async(server.ws_url()).await.expect("dial");

        let server_conn = wait_for_connections(&server, 1).await.remove(0);
        client
            .send(Message::Binary("hello".into()))
            .await
            .expect("client write");

        let payload = timeout(WAIT, server_conn.recv()).await.expect("recv in time");
        assert_eq!(payload.as_deref(), Some(&b"hello"[..]));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_send() {
        init_tracing();
        let server = Server::builder().bind().await.expect("bind");
        let (mut client, _) = connect_async(server.ws_url()).await.expect("dial");

        let server_conn = wait_for_connections(&server, 1).await.remove(0);
        assert!(server_conn.remote_addr().is_some());
        assert!(!server_conn.local_addr_string().is_empty());
        server_conn.send("hello").expect("send");

        let message = timeout(WAIT, client.next())
            .await
            .expect("read in time")
            .expect("open")
            .expect("valid");
        assert_eq!(message, Message::Binary("hello".into()));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_invoked_and_can_send() {
        init_tracing();
        let calls = Arc::new(AtomicUsize::new(0));
        let (hit_tx, mut hit_rx) = mpsc::unbounded_channel();

        let counter = Arc::clone(&calls);
        let server = Server::builder()
            .handler(move |connection: Connection| {
                let counter = Arc::clone(&counter);
                let hit_tx = hit_tx.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    connection.send("hello").expect("send");
                    let _ = hit_tx.send(());
                }
            })
            .bind()
            .await
            .expect("bind");

        let (mut client, _) = connect_async(server.ws_url()).await.expect("dial");

        timeout(WAIT, hit_rx.recv())
            .await
            .expect("handler called in time")
            .expect("handler signalled");

        let message = timeout(WAIT, client.next())
            .await
            .expect("read in time")
            .expect("open")
            .expect("valid");
        assert_eq!(message, Message::Binary("hello".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_plain_http_request_gets_400() {
        init_tracing();
        let server = Server::builder().bind().await.expect("bind");

        let mut stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .expect("write request");

        let mut response = Vec::new();
        timeout(WAIT, stream.read_to_end(&mut response))
            .await
            .expect("response in time")
            .expect("read response");

        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 400"), "got {response:?}");

        sleep(Duration::from_millis(20)).await;
        assert!(server.registry().is_empty());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_upgrade_without_key_gets_400() {
        init_tracing();
        let server = Server::builder().bind().await.expect("bind");

        let mut stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\r\n")
            .await
            .expect("write request");

        let mut response = Vec::new();
        timeout(WAIT, stream.read_to_end(&mut response))
            .await
            .expect("response in time")
            .expect("read response");

        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 400"), "got {response:?}");
        assert!(server.registry().is_empty());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_post_gets_405() {
        init_tracing();
        let server = Server::builder().bind().await.expect("bind");

        let mut stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        stream
            .write_all(b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n")
            .await
            .expect("write request");

        let mut response = Vec::new();
        timeout(WAIT, stream.read_to_end(&mut response))
            .await
            .expect("response in time")
            .expect("read response");

        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 405"), "got {response:?}");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped_after_handshake_timeout() {
        init_tracing();
        let server = Server::builder()
            .handshake_timeout(Duration::from_millis(50))
            .bind()
            .await
            .expect("bind");

        let mut stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        stream.write_all(b"GET / HTTP/1.1\r\n").await.expect("write partial head");

        let mut response = Vec::new();
        let _ = timeout(WAIT, stream.read_to_end(&mut response))
            .await
            .expect("server drops stream in time");
        assert!(response.is_empty());
        assert!(server.registry().is_empty());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_abandons_pending_handshakes() {
        init_tracing();
        let server = Server::builder().bind().await.expect("bind");

        let mut stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        stream.write_all(b"GET / HTTP/1.1\r\n").await.expect("write partial head");
        sleep(Duration::from_millis(20)).await;

        timeout(WAIT, server.shutdown())
            .await
            .expect("shutdown does not wait for the handshake timeout");
        assert!(server.registry().is_empty());

        stream
            .write_all(b"Connection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
            .await
            .ok();
        sleep(Duration::from_millis(20)).await;
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_client_disconnect_evicts_connection() {
        init_tracing();
        let server = Server::builder().bind().await.expect("bind");
        let (mut client, _) = connect_async(server.ws_url()).await.expect("dial");

        wait_for_connections(&server, 1).await;
        client.close(None).await.expect("client close");

        wait_for_connections(&server, 0).await;

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        init_tracing();
        let server = Server::builder().bind().await.expect("bind");
        let (mut client, _) = connect_async(server.ws_url()).await.expect("dial");

        let server_conn = wait_for_connections(&server, 1).await.remove(0);
        server.shutdown().await;

        timeout(WAIT, server_conn.closed()).await.expect("closed");
        assert!(server.registry().is_empty());

        let closing = timeout(WAIT, client.next()).await.expect("read in time");
        assert!(matches!(closing, Some(Ok(Message::Close(_)))));
    }
}
