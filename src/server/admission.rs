//! Admission policy for owned and pooled connections.
//!
//! A pure decision over `(owned, limit, allowed)`. The registry calls it under
//! its write lock, so the count it sees is exact.
//!
//! | Condition | Decision | Who is closed |
//! |-----------|----------|---------------|
//! | transport disabled | `Reject(NotPermitted)` | the new connection |
//! | `owned >= limit` | `Reject(LimitExceeded)` | the new connection **and** its owner |
//! | otherwise | `Admit` | nobody |
//!
//! The asymmetry is intentional: a client that exceeds its limit is treated as
//! misbehaving, a client that asks for a disabled transport is not.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::protocol::CloseReason;

// ============================================================================
// RejectReason
// ============================================================================

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The owner already holds `limit` secondaries.
    LimitExceeded,
    /// The transport is disabled.
    NotPermitted,
}

impl RejectReason {
    /// Returns `true` if the owning primary must be closed as well.
    #[inline]
    #[must_use]
    pub const fn closes_owner(&self) -> bool {
        matches!(self, Self::LimitExceeded)
    }

    /// Close reason reported for the refused connection (and its owner).
    #[inline]
    #[must_use]
    pub const fn close_reason(&self) -> CloseReason {
        match self {
            Self::LimitExceeded => CloseReason::SecondaryLimitExceeded,
            Self::NotPermitted => CloseReason::NotPermitted,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LimitExceeded => f.write_str("limit exceeded"),
            Self::NotPermitted => f.write_str("not permitted"),
        }
    }
}

// ============================================================================
// Decision
// ============================================================================

/// Outcome of [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Accept the connection.
    Admit,
    /// Refuse the connection.
    Reject(RejectReason),
}

/// Decides whether one more owned connection may be admitted.
///
/// `allowed` is checked first, so a disabled transport never reports
/// `LimitExceeded`.
#[must_use]
pub const fn decide(owned: usize, limit: usize, allowed: bool) -> Decision {
    if !allowed {
        return Decision::Reject(RejectReason::NotPermitted);
    }
    if owned >= limit {
        return Decision::Reject(RejectReason::LimitExceeded);
    }
    Decision::Admit
}

// ============================================================================
// Tests
// ============================================================================
