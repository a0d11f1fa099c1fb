//! Transport layer.
//!
//! The hub knows three transport kinds. Everything above this module talks to
//! them through the [`Connection`] trait and never sees concrete types.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket/TCP    ┌──────────────────┐
//! │   Client     │◄──────────────────►│ StreamConnection │  primary
//! │              │                    │        │ owns    │
//! │              │       UDP          │        ▼         │
//! │              │◄──────────────────►│ DatagramConn.    │  secondary
//! └──────────────┘                    └──────────────────┘
//!
//!   TertiaryTransport (plug-in) ──► TertiaryListener ──► ConnectionHandle
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `acceptor` | TCP accept and WebSocket handshake |
//! | `connection` | [`Connection`] trait and handle types |
//! | `datagram` | Secondary (UDP) connection |
//! | `kind` | [`TransportKind`] tag |
//! | `lifecycle` | [`ConnectionCore`] shared lifecycle state |
//! | `stream` | Primary (WebSocket) connection and event loop |
//! | `tertiary` | Tertiary plug-in traits |

// ============================================================================
// Submodules
// ============================================================================

/// TCP accept and WebSocket handshake.
pub mod acceptor;

/// Connection trait.
pub mod connection;

/// Secondary (UDP) connection.
pub mod datagram;

/// Transport kind tag.
pub mod kind;

/// Shared lifecycle state.
pub mod lifecycle;

/// Primary (WebSocket) connection.
pub mod stream;

/// Tertiary plug-in traits.
pub mod tertiary;

// ============================================================================
// Re-exports
// ============================================================================

pub use acceptor::{StreamAcceptor, upgrade};
pub use connection::{ClosedHandler, Connection, ConnectionHandle, SecondaryHandler};
pub use datagram::DatagramConnection;
pub use kind::TransportKind;
pub use lifecycle::ConnectionCore;
pub use stream::StreamConnection;
pub use tertiary::{TertiaryListener, TertiaryTransport};
