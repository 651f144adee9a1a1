//! Per-connection tuning options.
//!
//! # Example
//!
//! ```ignore
//! use ws_duplex::ConnectionOptions;
//!
//! let options = ConnectionOptions::new()
//!     .with_inbound_capacity(256)
//!     .with_max_write_failures(None);
//! ```

// ============================================================================
// Constants
// ============================================================================

/// Default number of received payloads buffered before the receiver loop
/// waits for the consumer.
pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

/// Default number of consecutive write failures that close a connection.
pub const DEFAULT_MAX_WRITE_FAILURES: u32 = 3;

// ============================================================================
// ConnectionOptions
// ============================================================================

/// Options applied to every [`Connection`](crate::Connection) built with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Capacity of the inbound queue. Values below 1 are treated as 1.
    pub inbound_capacity: usize,

    /// Consecutive write failures after which the connection is closed.
    ///
    /// `None` keeps writing after every failure and only logs it.
    pub max_write_failures: Option<u32>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            max_write_failures: Some(DEFAULT_MAX_WRITE_FAILURES),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ConnectionOptions {
    /// Sets the inbound queue capacity.
    #[inline]
    #[must_use]
    pub const fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }

    /// Sets the write-failure limit. `None` disables it.
    #[inline]
    #[must_use]
    pub const fn with_max_write_failures(mut self, limit: Option<u32>) -> Self {
        self.max_write_failures = limit;
        self
    }

    /// Returns the inbound capacity actually used for the queue.
    #[inline]
    #[must_use]
    pub(crate) fn effective_inbound_capacity(&self) -> usize {
        self.inbound_capacity.max(1)
    }
}

// ============================================================================
// Tests
// ============================================================================
