//! WebSocket server and connection registry.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Server`] | Listener and accept loop performing the HTTP upgrade |
//! | [`ServerBuilder`] | Fluent configuration builder |
//! | [`ConnectionRegistry`] | Keyed store of accepted connections |

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder for server configuration.
pub mod builder;

/// Server and accept loop.
pub mod core;

/// Keyed store of accepted connections.
pub mod registry;

mod upgrade;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::{DEFAULT_HANDSHAKE_TIMEOUT, ServerBuilder};
pub use core::Server;
pub use registry::ConnectionRegistry;
