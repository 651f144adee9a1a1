//! Duplex WebSocket connection.
//!
//! A [`Connection`] turns one WebSocket stream into two message queues:
//!
//! - **outbound**: filled by [`Connection::send`], drained by the sender loop
//! - **inbound**: filled by the receiver loop, read with [`Connection::recv`]
//!
//! # Lifecycle
//!
//! Construction spawns a supervising task that owns both halves of the
//! stream. It runs the receiver loop inline and the sender loop as a
//! separate task. Whatever ends the receiver loop (read error, non-binary
//! message, peer close, [`Connection::close`]) starts the one close sequence:
//!
//! 1. `closed` is set under the outbound lock, so `send` starts failing
//! 2. the sender loop is signalled, drains queued payloads, writes a
//!    `1000 Normal` close frame and closes the transport
//! 3. the inbound queue is closed and [`Connection::closed`] resolves

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{self, SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};

use super::endpoint::Endpoint;
use super::options::ConnectionOptions;

// ============================================================================
// Connection
// ============================================================================

/// Duplex message connection over one WebSocket transport.
///
/// Cheap to clone; all clones share the same queues and close state.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync`. `send` may be called from any task and
/// never blocks. Concurrent `recv` callers are served one at a time.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

/// State shared by every clone of a connection.
struct Shared {
    id: String,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    outbound: Arc<Mutex<Outbound>>,
    inbound: AsyncMutex<mpsc::Receiver<Bytes>>,
    /// Asks the receiver loop to stop.
    stop: CancellationToken,
    /// Fired once close coordination has finished.
    done: CancellationToken,
}

/// Outbound queue producer and the flag that gates it.
struct Outbound {
    closed: bool,
    queue: mpsc::UnboundedSender<Bytes>,
}

impl Connection {
    /// Wraps an established WebSocket stream with default options.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(id: impl Into<String>, ws_stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Endpoint + Unpin + Send + 'static,
    {
        Self::with_options(id, ws_stream, ConnectionOptions::default())
    }

    /// Wraps an established WebSocket stream.
    ///
    /// Spawns the connection loops. Must be called from within a tokio
    /// runtime.
    pub fn with_options<S>(
        id: impl Into<String>,
        ws_stream: WebSocketStream<S>,
        options: ConnectionOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Endpoint + Unpin + Send + 'static,
    {
        let id = id.into();
        let remote_addr = ws_stream.get_ref().peer_addr();
        let local_addr = ws_stream.get_ref().local_addr();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(options.effective_inbound_capacity());
        let outbound = Arc::new(Mutex::new(Outbound {
            closed: false,
            queue: outbound_tx,
        }));
        let stop = CancellationToken::new();
        let done = CancellationToken::new();

        let (sink, stream) = ws_stream.split();
        let lifecycle = Lifecycle {
            id: Arc::from(id.as_str()),
            sink,
            stream,
            outbound: Arc::clone(&outbound),
            outbound_rx,
            inbound_tx,
            stop: stop.clone(),
            done: done.clone(),
            max_write_failures: options.max_write_failures,
        };
        tokio::spawn(lifecycle.run());

        debug!(id = %id, ?remote_addr, "Connection created");

        Self {
            shared: Arc::new(Shared {
                id,
                remote_addr,
                local_addr,
                outbound,
                inbound: AsyncMutex::new(inbound_rx),
                stop,
                done,
            }),
        }
    }

    /// Returns the connection identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Returns the peer address captured at construction.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    /// Returns the local address captured at construction.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Returns the local address as a string, or an empty string if unknown.
    #[must_use]
    pub fn local_addr_string(&self) -> String {
        self.shared
            .local_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    /// Queues a payload to be written as one binary message.
    ///
    /// Safe to call after close: it returns an error instead of blocking.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if close coordination has started
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        let outbound = self.shared.outbound.lock();
        if outbound.closed {
            return Err(Error::ConnectionClosed);
        }
        // The sender loop holds the receiver until after `closed` is set.
        outbound
            .queue
            .send(payload.into())
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Receives the next payload.
    ///
    /// Returns `None` once the connection is closed and every buffered
    /// payload has been read.
    pub async fn recv(&self) -> Option<Bytes> {
        self.shared.inbound.lock().await.recv().await
    }

    /// Returns the inbound payloads as a stream.
    ///
    /// The stream ends when the connection closes. It shares the queue with
    /// [`recv`](Self::recv), so every payload is delivered to one reader.
    pub fn inbound(&self) -> impl Stream<Item = Bytes> + Send + 'static {
        stream::unfold(self.clone(), |connection| async move {
            let payload = connection.recv().await?;
            Some((payload, connection))
        })
    }

    /// Requests the connection to close.
    ///
    /// Stops the receiver loop, which runs the regular close sequence.
    /// Payloads queued before the close takes effect are still written.
    /// Calling it more than once has no further effect.
    pub fn close(&self) {
        if !self.shared.stop.is_cancelled() {
            debug!(id = %self.shared.id, "Close requested");
            self.shared.stop.cancel();
        }
    }

    /// Returns `true` once the connection refuses new payloads.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.outbound.lock().closed
    }

    /// Waits until close coordination has finished.
    ///
    /// At that point the close frame has been written (or failed) and the
    /// transport is closed.
    pub async fn closed(&self) {
        self.shared.done.cancelled().await;
    }

    /// Returns `true` if both handles refer to the same connection.
    #[inline]
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("remote_addr", &self.shared.remote_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Everything the supervising task owns.
struct Lifecycle<S> {
    id: Arc<str>,
    sink: SplitSink<WebSocketStream<S>, Message>,
    stream: SplitStream<WebSocketStream<S>>,
    outbound: Arc<Mutex<Outbound>>,
    outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    inbound_tx: mpsc::Sender<Bytes>,
    stop: CancellationToken,
    done: CancellationToken,
    max_write_failures: Option<u32>,
}

impl<S> Lifecycle<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Runs both loops and the close sequence.
    async fn run(self) {
        let Self {
            id,
            sink,
            stream,
            outbound,
            outbound_rx,
            inbound_tx,
            stop,
            done,
            max_write_failures,
        } = self;

        let kill = CancellationToken::new();
        let sender = SenderLoop {
            id: Arc::clone(&id),
            sink,
            queue: outbound_rx,
            kill: kill.clone(),
            stop: stop.clone(),
            max_write_failures,
            consecutive_failures: 0,
        };
        let sender_task = tokio::spawn(sender.run());

        ReceiverLoop {
            id: Arc::clone(&id),
            stream,
            inbound: &inbound_tx,
            stop,
        }
        .run()
        .await;

        outbound.lock().closed = true;
        kill.cancel();

        if let Err(e) = sender_task.await {
            error!(id = %id, error = %e, "Sender loop failed");
        }

        // Readers see end-of-stream only after the transport is closed.
        drop(inbound_tx);
        done.cancel();
        debug!(id = %id, "Connection closed");
    }
}

// ============================================================================
// Sender Loop
// ============================================================================

/// Writes queued payloads until killed.
struct SenderLoop<K> {
    id: Arc<str>,
    sink: K,
    queue: mpsc::UnboundedReceiver<Bytes>,
    kill: CancellationToken,
    stop: CancellationToken,
    max_write_failures: Option<u32>,
    consecutive_failures: u32,
}

impl<K> SenderLoop<K>
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                next = self.queue.recv() => match next {
                    Some(payload) => self.write(payload).await,
                    None => {
                        self.kill.cancelled().await;
                        break;
                    }
                },

                () = self.kill.cancelled() => break,
            }
        }

        // Anything enqueued before `closed` was set is still flushed.
        while let Ok(payload) = self.queue.try_recv() {
            self.write(payload).await;
        }

        self.shutdown().await;
    }

    async fn write(&mut self, payload: Bytes) {
        let len = payload.len();
        match self.sink.send(Message::Binary(payload)).await {
            Ok(()) => {
                self.consecutive_failures = 0;
                trace!(id = %self.id, len, "Message sent");
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                warn!(
                    id = %self.id,
                    error = %e,
                    failures = self.consecutive_failures,
                    "Unable to send message"
                );

                if let Some(limit) = self.max_write_failures
                    && self.consecutive_failures >= limit
                    && !self.stop.is_cancelled()
                {
                    warn!(id = %self.id, limit, "Write failure limit reached, closing connection");
                    self.stop.cancel();
                }
            }
        }
    }

    /// Writes the close frame and closes the transport.
    async fn shutdown(mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };

        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            debug!(id = %self.id, error = %e, "Close frame not sent");
        }

        if let Err(e) = self.sink.close().await {
            debug!(id = %self.id, error = %e, "Transport close failed");
        }

        debug!(id = %self.id, "Sender loop terminated");
    }
}

// ============================================================================
// Receiver Loop
// ============================================================================

/// Reads messages into the inbound queue until the first failure.
struct ReceiverLoop<'a, R> {
    id: Arc<str>,
    stream: R,
    inbound: &'a mpsc::Sender<Bytes>,
    stop: CancellationToken,
}

impl<R> ReceiverLoop<'_, R>
where
    R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    /// Returns on the first read error or protocol violation; neither is
    /// retried.
    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                biased;

                () = self.stop.cancelled() => {
                    debug!(id = %self.id, "Receiver loop stopped");
                    return;
                }

                // Every `Connection` handle is gone.
                () = self.inbound.closed() => {
                    debug!(id = %self.id, "Inbound queue dropped");
                    return;
                }

                next = self.stream.next() => next,
            };

            let payload = match next {
                Some(Ok(Message::Binary(payload))) => payload,

                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,

                Some(Ok(Message::Close(frame))) => {
                    debug!(id = %self.id, ?frame, "Connection closed by remote");
                    return;
                }

                Some(Ok(message)) => {
                    let err = Error::protocol(format!(
                        "Not a binary message: {}",
                        message_kind(&message)
                    ));
                    warn!(id = %self.id, error = %err, "Unable to read message");
                    return;
                }

                Some(Err(e)) => {
                    warn!(id = %self.id, error = %e, "Unable to read message");
                    return;
                }

                None => {
                    debug!(id = %self.id, "Transport stream ended");
                    return;
                }
            };

            trace!(id = %self.id, len = payload.len(), "Message received");

            tokio::select! {
                biased;

                () = self.stop.cancelled() => {
                    debug!(id = %self.id, "Receiver loop stopped");
                    return;
                }

                sent = self.inbound.send(payload) => {
                    if sent.is_err() {
                        debug!(id = %self.id, "Inbound queue dropped");
                        return;
                    }
                }
            }
        }
    }
}

/// Short name of a message kind for logs.
fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}

// ============================================================================
// Tests
// ============================================================================
