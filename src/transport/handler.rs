//! Callback invoked once per established connection.

use std::future::Future;

use async_trait::async_trait;

use super::Connection;

/// Strategy invoked with every newly established [`Connection`].
///
/// The client awaits it once per dial cycle and redials when it returns.
/// The server awaits it once per accepted transport.
///
/// Any `Fn(Connection) -> impl Future<Output = ()>` closure is a handler:
///
/// ```ignore
/// use ws_duplex::{Client, Connection};
///
/// let client = Client::new("ws://127.0.0.1:9000", |connection: Connection| async move {
///     while let Some(payload) = connection.recv().await {
///         let _ = connection.send(payload);
///     }
/// })?;
/// ```
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Drives one connection. Returning ends the handler's use of it.
    async fn on_connection(&self, connection: Connection);
}

#[async_trait]
impl<F, Fut> ConnectionHandler for F
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_connection(&self, connection: Connection) {
        (self)(connection).await;
    }
}
