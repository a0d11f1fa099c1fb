//! Close reasons.
//!
//! Every connection ends with exactly one [`CloseReason`]. The reason travels
//! with the `Lost` event and, when the remote side is notified, inside the
//! `close` frame.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// CloseReason
// ============================================================================

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CloseReason {
    /// Transport failure (reset, read/write error).
    NetworkError,

    /// The server closed the connection (shutdown or explicit close).
    ServerClosed,

    /// The remote peer closed the connection.
    ClientClosed,

    /// Handshake or keep-alive timed out.
    Timeout,

    /// The peer sent a frame the server does not understand.
    ProtocolViolation,

    /// The owning primary requested more secondaries than allowed.
    SecondaryLimitExceeded,

    /// The transport is disabled on this server.
    NotPermitted,

    /// The owning primary was already gone when the secondary bootstrapped.
    OwnerClosed,
}

impl CloseReason {
    /// Returns `true` if the closure was initiated by this server.
    #[inline]
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(
            self,
            Self::ServerClosed | Self::SecondaryLimitExceeded | Self::NotPermitted | Self::OwnerClosed
        )
    }

    /// Returns the wire name of the reason.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "networkError",
            Self::ServerClosed => "serverClosed",
            Self::ClientClosed => "clientClosed",
            Self::Timeout => "timeout",
            Self::ProtocolViolation => "protocolViolation",
            Self::SecondaryLimitExceeded => "secondaryLimitExceeded",
            Self::NotPermitted => "notPermitted",
            Self::OwnerClosed => "ownerClosed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================
