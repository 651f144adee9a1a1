//! Dial/redial supervisor.
//!
//! The supervisor task cycles `Dialing → Connected → Dialing` until shut
//! down. A failed dial waits the retry interval and tries again, with no
//! attempt limit. A successful dial publishes the new [`Connection`] and
//! awaits the handler; when the handler returns, the supervisor redials.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::transport::{Connection, ConnectionHandler, ConnectionOptions};

use super::builder::ClientBuilder;

// ============================================================================
// Client
// ============================================================================

/// WebSocket client that keeps one connection alive.
///
/// Created through [`Client::new`] or [`Client::builder`]. The supervisor
/// runs until [`Client::shutdown`] is called or the client is dropped.
pub struct Client {
    /// Target URL.
    url: String,
    /// Most recently established connection.
    current: Arc<RwLock<Option<Connection>>>,
    /// Stops the supervisor.
    cancel: CancellationToken,
    /// Supervisor task, taken by `shutdown`.
    task: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// Client - Constructor
// ============================================================================

impl Client {
    /// Creates a client and starts dialing `url`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the URL is empty or invalid
    pub fn new(
        url: impl Into<String>,
        handler: impl ConnectionHandler + 'static,
    ) -> crate::Result<Self> {
        Self::builder(url).handler(handler).build()
    }

    /// Creates a builder for a client targeting `url`.
    #[inline]
    #[must_use]
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Spawns the supervisor. Input is already validated.
    pub(crate) fn start(
        url: String,
        handler: Arc<dyn ConnectionHandler>,
        retry_interval: Duration,
        options: ConnectionOptions,
    ) -> Self {
        let current = Arc::new(RwLock::new(None));
        let cancel = CancellationToken::new();

        let supervisor = Supervisor {
            url: url.clone(),
            handler,
            retry_interval,
            options,
            current: Arc::clone(&current),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            url,
            current,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }
}

// ============================================================================
// Client - Public API
// ============================================================================

impl Client {
    /// Returns the target URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the most recently established connection.
    ///
    /// A returned handle stays usable after a redial, but is no longer the
    /// current connection.
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        self.current.read().clone()
    }

    /// Returns `true` while the supervisor task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops the supervisor and waits for it to finish.
    ///
    /// The current connection is closed so that a handler waiting on it
    /// returns. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        if let Some(connection) = self.current.read().as_ref() {
            connection.close();
        }

        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(url = %self.url, error = %e, "Client supervisor failed");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(connection) = self.current.read().as_ref() {
            connection.close();
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.url)
            .field("connection", &*self.current.read())
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// State owned by the supervisor task.
struct Supervisor {
    url: String,
    handler: Arc<dyn ConnectionHandler>,
    retry_interval: Duration,
    options: ConnectionOptions,
    current: Arc<RwLock<Option<Connection>>>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        info!(url = %self.url, "Client supervisor started");

        while let Some(connection) = self.dial().await {
            *self.current.write() = Some(connection.clone());

            // Shutdown may have read the slot just before it was replaced.
            if self.cancel.is_cancelled() {
                connection.close();
                break;
            }

            info!(url = %self.url, remote = ?connection.remote_addr(), "Connected");

            // The handler owns this connection's lifetime; redial after it.
            self.handler.on_connection(connection).await;

            if self.cancel.is_cancelled() {
                break;
            }

            debug!(url = %self.url, "Handler returned, redialing");
        }

        if let Some(connection) = self.current.read().as_ref() {
            connection.close();
        }

        info!(url = %self.url, "Client supervisor stopped");
    }

    /// Dials until a transport is established.
    ///
    /// Returns `None` once cancelled.
    async fn dial(&self) -> Option<Connection> {
        loop {
            let dialed = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                dialed = connect_async(self.url.as_str()) => dialed,
            };

            match dialed {
                Ok((ws_stream, _response)) => {
                    return Some(Connection::with_options(
                        self.url.clone(),
                        ws_stream,
                        self.options,
                    ));
                }
                Err(e) => {
                    let err = Error::connection(e.to_string());
                    warn!(url = %self.url, error = %err, "Unable to create WebSocket connection");
                }
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                () = sleep(self.retry_interval) => {}
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    use crate::transport::testing::init_tracing;

    const WAIT: Duration = Duration::from_secs(5);

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        (listener, url)
    }

    #[tokio::test]
    async fn test_handler_send_reaches_server() {
        init_tracing();
        let (listener, url) = listener().await;

        let client = Client::new(url.clone(), |connection: Connection| async move {
            connection.send("hello").expect("send");
            while connection.recv().await.is_some() {}
        })
        .expect("client");

        let (stream, _) = timeout(WAIT, listener.accept()).await.expect("accept").expect("tcp");
        let mut server = accept_async(stream).await.expect("handshake");

        let message = timeout(WAIT, server.next())
            .await
            .expect("read in time")
            .expect("open")
            .expect("valid");
        assert_eq!(message, Message::Binary("hello".into()));

        let connection = client.connection().expect("published");
        assert_eq!(connection.id(), url);
        assert!(connection.remote_addr().is_some());

        client.shutdown().await;
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_redials_after_handler_returns() {
        init_tracing();
        let (listener, url) = listener().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let client = Client::builder(url)
            .retry_interval(Duration::from_millis(20))
            .handler(move |_connection: Connection| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .expect("client");

        for _ in 0..2 {
            let (stream, _) = timeout(WAIT, listener.accept())
                .await
                .expect("accept")
                .expect("tcp");
            let _ = accept_async(stream).await;
        }

        timeout(WAIT, async {
            while calls.load(Ordering::SeqCst) < 2 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler called twice");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_keeps_retrying_when_unreachable() {
        init_tracing();
        // Bind then drop to get a port with nothing listening.
        let (listener, url) = listener().await;
        drop(listener);

        let client = Client::builder(url)
            .retry_interval(Duration::from_millis(20))
            .handler(|_connection: Connection| async {})
            .build()
            .expect("client");

        sleep(Duration::from_millis(150)).await;
        assert!(client.is_running());
        assert!(client.connection().is_none());

        timeout(WAIT, client.shutdown()).await.expect("shutdown in time");
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_waiting_handler() {
        init_tracing();
        let (listener, url) = listener().await;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let client = Client::new(url, move |connection: Connection| {
            let done_tx = done_tx.clone();
            async move {
                while connection.recv().await.is_some() {}
                let _ = done_tx.send(());
            }
        })
        .expect("client");

        let (stream, _) = timeout(WAIT, listener.accept()).await.expect("accept").expect("tcp");
        let mut server = accept_async(stream).await.expect("handshake");

        timeout(WAIT, async {
            while client.connection().is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connected");

        timeout(WAIT, client.shutdown()).await.expect("shutdown in time");
        assert!(done_rx.recv().await.is_some());

        // The peer sees the close frame.
        let closing = timeout(WAIT, server.next()).await.expect("read in time");
        assert!(matches!(closing, Some(Ok(Message::Close(_)))));
    }
}
