//! Wire protocol types.
//!
//! This module defines what travels over the shipped transports. The hub's
//! core never inspects payloads; it only needs close reasons and the
//! secondary bootstrap frames.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `close` | [`CloseReason`] carried by `Lost` events and `close` frames |
//! | `frame` | [`Frame`] envelope (packet, secondary bootstrap, close) |
//! | `packet` | [`Packet`] and [`PacketHandler`] |

// ============================================================================
// Submodules
// ============================================================================

/// Close reasons.
pub mod close;

/// Wire frames.
pub mod frame;

/// Application packets.
pub mod packet;

// ============================================================================
// Re-exports
// ============================================================================

pub use close::CloseReason;
pub use frame::Frame;
pub use packet::{Packet, PacketHandler};
