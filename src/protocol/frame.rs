//! Wire frames.
//!
//! Frames are JSON objects tagged by `type`. The primary transport carries one
//! frame per WebSocket text message, the secondary transport one frame per
//! datagram.
//!
//! | Type | Direction | Purpose |
//! |------|-----------|---------|
//! | `packet` | both | Application packet |
//! | `secondaryRequest` | client → server | Ask for a secondary (UDP) connection |
//! | `secondaryReady` | server → client | Secondary socket bound, carries its port |
//! | `close` | both | Orderly close with reason |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::TransportKind;

use super::{CloseReason, Packet};

// ============================================================================
// Frame
// ============================================================================

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Application packet.
    Packet(Packet),

    /// Client asks for a secondary connection.
    ///
    /// `port` is the client's local UDP port; the server pairs it with the
    /// primary connection's peer IP.
    #[serde(rename_all = "camelCase")]
    SecondaryRequest {
        /// Client UDP port.
        port: u16,
    },

    /// Server bound the secondary socket.
    #[serde(rename_all = "camelCase")]
    SecondaryReady {
        /// Server UDP port the client should talk to.
        port: u16,
    },

    /// Orderly close.
    Close {
        /// Reason for closing.
        reason: CloseReason,
    },
}

impl Frame {
    /// Parses a frame from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if the text is not a valid frame.
    #[inline]
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parses a frame from raw bytes (one datagram).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if the bytes are not a valid frame.
    #[inline]
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Returns the wire `type` tag.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Packet(_) => "packet",
            Self::SecondaryRequest { .. } => "secondaryRequest",
            Self::SecondaryReady { .. } => "secondaryReady",
            Self::Close { .. } => "close",
        }
    }

    /// Checks that a frame received from a client may arrive on a `kind`
    /// connection.
    ///
    /// Only primaries take `secondaryRequest`; `secondaryReady` is never sent
    /// by clients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for a frame the transport does not accept.
    pub fn inbound_on(self, kind: TransportKind) -> Result<Self> {
        let accepted = match self {
            Self::Packet(_) | Self::Close { .. } => true,
            Self::SecondaryRequest { .. } => kind == TransportKind::Primary,
            Self::SecondaryReady { .. } => false,
        };

        if accepted {
            Ok(self)
        } else {
            Err(Error::protocol(format!(
                "{} frame not accepted from a {kind} client",
                self.name()
            )))
        }
    }

    /// Serializes the frame to JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    #[inline]
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
