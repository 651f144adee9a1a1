//! Duplex message connections over WebSocket.
//!
//! This crate turns an established WebSocket stream into a [`Connection`]
//! with two independent queues: payloads handed to [`Connection::send`] are
//! written by a sender loop, and binary messages read by a receiver loop are
//! delivered through [`Connection::recv`]. Two thin layers sit on top:
//!
//! - [`Client`] dials a URL, hands each connection to a handler and redials
//!   whenever the handler returns or the dial fails
//! - [`Server`] accepts upgrade requests, registers each connection in a
//!   [`ConnectionRegistry`] under a fresh UUID and runs a handler for it
//!
//! # Architecture
//!
//! ```text
//! transport ──► receiver loop ──► inbound ──► handler
//!     ▲                                          │
//!     └──────── sender loop ◄── outbound ◄───────┘ send()
//! ```
//!
//! Any failure of the receiver loop (read error, non-binary message, peer
//! close) closes the connection: `send` starts returning
//! [`Error::ConnectionClosed`], queued payloads are flushed, a `1000 Normal`
//! close frame is written, and the inbound stream ends.
//!
//! # Quick Start
//!
//! ```no_run
//! use ws_duplex::{Connection, Result, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Server::builder()
//!         .port(9000)
//!         .handler(|connection: Connection| async move {
//!             while let Some(payload) = connection.recv().await {
//!                 if connection.send(payload).is_err() {
//!                     break;
//!                 }
//!             }
//!         })
//!         .bind()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Redialing client supervisor |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`server`] | Accept surface and connection registry |
//! | [`transport`] | Duplex connection and handler contract |

// ============================================================================
// Modules
// ============================================================================

/// Redialing client supervisor.
///
/// Use [`Client::builder()`] to configure retry interval and options.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// WebSocket server and connection registry.
pub mod server;

/// Duplex connection over one WebSocket transport.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{Client, ClientBuilder};

// Error types
pub use error::{Error, Result};

// Server types
pub use server::{ConnectionRegistry, Server, ServerBuilder};

// Transport types
pub use transport::{Connection, ConnectionHandler, ConnectionOptions, Endpoint};

// Payload type
pub use bytes::Bytes;
