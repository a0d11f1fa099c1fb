//! Application packets.
//!
//! The hub does not define application schemas. A [`Packet`] is a named
//! kind plus an arbitrary JSON payload; applications install a
//! [`PacketHandler`] per kind on the server, which applies it to every
//! connection it accepts.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::ConnectionId;

// ============================================================================
// Types
// ============================================================================

/// Callback invoked for each inbound packet of a registered kind.
///
/// Runs on the connection's I/O task and must not block.
pub type PacketHandler = Arc<dyn Fn(ConnectionId, Packet) + Send + Sync>;

// ============================================================================
// Packet
// ============================================================================

/// An application packet.
///
/// # Format
///
/// ```json
/// { "kind": "chat.message", "payload": { "text": "hello" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Packet kind, used to route to a handler.
    pub kind: String,

    /// Kind-specific data.
    #[serde(default)]
    pub payload: Value,
}

impl Packet {
    /// Creates a packet with the given kind and payload.
    #[inline]
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Creates a packet with a `null` payload.
    #[inline]
    #[must_use]
    pub fn empty(kind: impl Into<String>) -> Self {
        Self::new(kind, Value::Null)
    }
}

// ============================================================================
// Tests
// ============================================================================
