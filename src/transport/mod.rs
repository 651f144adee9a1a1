//! WebSocket transport layer.
//!
//! This module wraps one established WebSocket stream into a duplex
//! [`Connection`] and defines the callback contract used by the client and
//! the server.
//!
//! # Architecture
//!
//! ```text
//!              send()                                   recv()
//!                │                                         ▲
//!                ▼                                         │
//!   ┌──────────────────────┐                  ┌──────────────────────┐
//!   │ outbound (unbounded) │                  │  inbound (bounded)   │
//!   └──────────┬───────────┘                  └──────────▲───────────┘
//!              │ sender loop                 receiver loop│
//!              ▼                                          │
//!   ┌─────────────────────────────────────────────────────┴─────────┐
//!   │                     WebSocket transport                       │
//!   └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Duplex connection, sender/receiver loops, close coordination |
//! | `endpoint` | Address access for the underlying byte stream |
//! | `handler` | Per-connection callback trait |
//! | `options` | Per-connection tuning |

// ============================================================================
// Submodules
// ============================================================================

/// Duplex connection and its loops.
pub mod connection;

/// Address access for byte streams.
pub mod endpoint;

/// Per-connection callback.
pub mod handler;

/// Per-connection options.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use endpoint::Endpoint;
pub use handler::ConnectionHandler;
pub use options::ConnectionOptions;

// ============================================================================
// Test Support
// ============================================================================
