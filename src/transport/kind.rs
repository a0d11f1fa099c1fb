//! Transport kind tag.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// TransportKind
// ============================================================================

/// Which transport a connection belongs to.
///
/// The registry is parameterized over this tag and never over concrete
/// transport types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// Stream transport (WebSocket over TCP). May own secondaries.
    Primary,

    /// Datagram transport (UDP), owned by exactly one primary.
    Secondary,

    /// Unowned, flat-pooled transport (short-range radio class).
    Tertiary,
}

impl TransportKind {
    /// All kinds, in cascade order.
    pub const ALL: [Self; 3] = [Self::Primary, Self::Secondary, Self::Tertiary];

    /// Returns the display name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Tertiary => "tertiary",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
