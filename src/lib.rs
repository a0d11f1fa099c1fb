//! Connection Hub - multi-transport connection server.
//!
//! Accepts long-lived client connections over three transport kinds and keeps
//! track of how they relate to each other.
//!
//! # Architecture
//!
//! - **Primary** (WebSocket over TCP): the main client session. Accepted by a
//!   listener on a configurable port.
//! - **Secondary** (UDP): a companion channel bootstrapped through its primary.
//!   Each secondary is owned by exactly one primary; when the primary goes,
//!   every secondary it owns goes with it.
//! - **Tertiary** (plug-in transport): an independent flat pool with its own
//!   listener and no ownership relation.
//!
//! Key design principles:
//!
//! - The core only sees the [`Connection`] trait, never concrete transports
//! - Each connection reports its closure exactly once
//! - Subscribers see `Established` before `Lost`, and a primary's `Lost` after
//!   the `Lost` of every secondary it owned
//!
//! # Quick Start
//!
//! ```no_run
//! use connection_hub::{Connection, ConnectionServer, Packet, Result, TransportKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = ConnectionServer::builder()
//!         .port(7777)
//!         .secondary_limit(2)
//!         .spawn()
//!         .await?;
//!
//!     server.on_lost(|connection, kind, reason| {
//!         println!("{kind} {} lost: {reason}", connection.id());
//!     });
//!
//!     server.broadcast(TransportKind::Primary, &Packet::empty("tick"));
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
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Connection and subscription IDs |
//! | [`protocol`] | Wire frames, packets and close reasons |
//! | [`server`] | Server, registry, admission, listeners, events |
//! | [`transport`] | Connection trait and shipped transports |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Wire protocol types.
pub mod protocol;

/// Connection server.
///
/// Use [`ConnectionServer::builder()`] to create a configured instance.
pub mod server;

/// Transport layer.
pub mod transport;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, SubscriptionId};

// Protocol types
pub use protocol::{CloseReason, Frame, Packet, PacketHandler};

// Server types
pub use server::{
    Admission, BroadcastReport, ConnectionServer, EventHub, ListenerState, RejectReason,
    ServerBuilder, ServerEvent, ServerOptions,
};

// Transport types
pub use transport::{
    Connection, ConnectionCore, ConnectionHandle, DatagramConnection, StreamConnection,
    TertiaryListener, TertiaryTransport, TransportKind,
};
