//! The connection collaborator interface.
//!
//! The hub's core only talks to connections through [`Connection`]. The
//! shipped transports ([`StreamConnection`](super::StreamConnection),
//! [`DatagramConnection`](super::DatagramConnection)) implement it, and so
//! can any third-party transport plugged in as a tertiary transport.
//!
//! Implementors only provide [`Connection::core`], [`Connection::send`] and
//! [`Connection::close`]; lifecycle hooks come from
//! [`ConnectionCore`](super::ConnectionCore).
//!
//! # Contract
//!
//! - The closed notification fires exactly once, with the reason of whichever
//!   close (local or remote) happened first.
//! - A local `close` fires the notification before it returns.
//! - `send` is best-effort and never closes the connection by itself.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::identifiers::ConnectionId;
use crate::protocol::{CloseReason, Packet, PacketHandler};

use super::TransportKind;
use super::lifecycle::ConnectionCore;

// ============================================================================
// Types
// ============================================================================

/// Shared handle to any connection.
pub type ConnectionHandle = Arc<dyn Connection>;

/// Closed notification callback. Called once with the close reason.
pub type ClosedHandler = Box<dyn FnOnce(CloseReason) + Send>;

/// Secondary bootstrapped callback: `(primary, secondary)`.
pub type SecondaryHandler = Arc<dyn Fn(ConnectionHandle, ConnectionHandle) + Send + Sync>;

// ============================================================================
// Connection
// ============================================================================

/// A transport endpoint with an open/closed lifecycle.
pub trait Connection: fmt::Debug + Send + Sync + 'static {
    /// Returns the shared lifecycle state.
    fn core(&self) -> &ConnectionCore;

    /// Sends a packet.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if the connection has ended
    /// - [`Error::Json`](crate::Error::Json) if the packet cannot be encoded
    fn send(&self, packet: &Packet) -> Result<()>;

    /// Closes the connection.
    ///
    /// No-op if already closed. When `notify_remote` is set the peer receives a
    /// `close` frame carrying `reason` before the transport shuts down.
    fn close(&self, reason: CloseReason, notify_remote: bool);

    /// Returns the connection's stable ID.
    #[inline]
    fn id(&self) -> ConnectionId {
        self.core().id()
    }

    /// Returns the transport kind.
    #[inline]
    fn kind(&self) -> TransportKind {
        self.core().kind()
    }

    /// Returns the remote address, if the transport has one.
    #[inline]
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.core().peer_addr()
    }

    /// Returns `true` until the connection closes.
    #[inline]
    fn is_alive(&self) -> bool {
        self.core().is_alive()
    }

    /// Subscribes to the closed notification.
    ///
    /// Replaces any previous subscriber. If the connection is already closed the
    /// handler runs immediately on the calling thread.
    #[inline]
    fn on_closed(&self, handler: ClosedHandler) {
        self.core().on_closed(handler);
    }

    /// Subscribes to secondary bootstraps (primaries only).
    ///
    /// Bootstraps that completed before a handler was bound are delivered on
    /// binding.
    #[inline]
    fn on_secondary(&self, handler: SecondaryHandler) {
        self.core().on_secondary(handler);
    }

    /// Routes inbound packets of `kind` to `handler`.
    #[inline]
    fn add_packet_handler(&self, kind: &str, handler: PacketHandler) {
        self.core().add_packet_handler(kind, handler);
    }

    /// Drops every subscription held by this connection.
    #[inline]
    fn detach_handlers(&self) {
        self.core().detach();
    }
}
