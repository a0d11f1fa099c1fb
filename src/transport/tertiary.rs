//! Tertiary transport plug-in interface.
//!
//! The tertiary transport (a short-range radio class link in practice) is
//! platform dependent, so the hub ships no implementation. Integrators provide
//! a [`TertiaryTransport`] through
//! [`ServerBuilder::tertiary_transport`](crate::ServerBuilder::tertiary_transport).
//!
//! Tertiary connections are unowned and live in a flat pool; they never take
//! part in the primary/secondary cascade.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io;

use async_trait::async_trait;

use super::connection::ConnectionHandle;

// ============================================================================
// TertiaryTransport
// ============================================================================

/// Factory for tertiary listeners.
#[async_trait]
pub trait TertiaryTransport: fmt::Debug + Send + Sync + 'static {
    /// Transport name used in logs.
    fn name(&self) -> &str;

    /// Returns `false` when the platform cannot host this transport.
    ///
    /// The server refuses to start the tertiary listener for an unsupported
    /// transport.
    fn is_supported(&self) -> bool {
        true
    }

    /// Starts listening with at most `backlog` pending connections.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the listener cannot be opened.
    async fn bind(&self, backlog: u32) -> io::Result<Box<dyn TertiaryListener>>;
}

// ============================================================================
// TertiaryListener
// ============================================================================

/// An open tertiary listener.
///
/// Dropping it releases the underlying resource.
#[async_trait]
pub trait TertiaryListener: Send + 'static {
    /// Waits for the next connection.
    ///
    /// `Ok(None)` means the listener was closed and will not produce more
    /// connections. The returned connection must report
    /// [`TransportKind::Tertiary`](super::TransportKind::Tertiary).
    ///
    /// # Errors
    ///
    /// Returns the I/O error of a failed accept. The listener stays usable.
    async fn accept(&mut self) -> io::Result<Option<ConnectionHandle>>;
}
