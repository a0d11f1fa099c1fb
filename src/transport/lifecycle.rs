//! Shared connection lifecycle.
//!
//! [`ConnectionCore`] holds the state every transport needs regardless of how
//! it moves bytes: identity, the alive flag, the one-shot closed notification,
//! the secondary bootstrap hook and the packet handler table.
//!
//! # Closed notification
//!
//! ```text
//! Open(handler?) ──finish(reason)──► Closed(reason)
//!        ▲                                │
//!   on_closed(h)                    on_closed(h) runs h(reason) immediately
//! ```
//!
//! [`ConnectionCore::finish`] wins exactly once (compare-and-swap on the alive
//! flag); every later call is a no-op. That is what makes "closed fires
//! exactly once" hold when a local close races a remote disconnect.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::identifiers::ConnectionId;
use crate::protocol::{CloseReason, Packet, PacketHandler};

use super::TransportKind;
use super::connection::{ClosedHandler, Connection, ConnectionHandle, SecondaryHandler};

// ============================================================================
// Slots
// ============================================================================

/// Closed notification state.
enum ClosedSlot {
    /// Still open; holds the current subscriber, if any.
    Open(Option<ClosedHandler>),
    /// Closed with this reason.
    Closed(CloseReason),
}

/// Secondary bootstrap hook state.
enum SecondarySlot {
    /// No handler yet; bootstraps are queued.
    Pending(Vec<(ConnectionHandle, ConnectionHandle)>),
    /// Handler bound; bootstraps are delivered immediately.
    Bound(SecondaryHandler),
    /// Owner released; new bootstraps are refused.
    Detached,
}

/// Where a bootstrapped secondary goes.
enum Route {
    Deliver(SecondaryHandler),
    Queued,
    Refuse,
}

// ============================================================================
// ConnectionCore
// ============================================================================

/// Lifecycle state shared by all transports.
pub struct ConnectionCore {
    /// Stable identity.
    id: ConnectionId,
    /// Transport tag.
    kind: TransportKind,
    /// Remote address, if any.
    peer: Option<SocketAddr>,
    /// Cleared by the first `finish`.
    alive: AtomicBool,
    /// Closed notification.
    closed: Mutex<ClosedSlot>,
    /// Secondary bootstrap hook.
    secondary: Mutex<SecondarySlot>,
    /// Inbound packet routing.
    packet_handlers: RwLock<FxHashMap<String, PacketHandler>>,
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConnectionCore - Constructor & Accessors
// ============================================================================

impl ConnectionCore {
    /// Creates the lifecycle state for a new connection with a fresh ID.
    #[must_use]
    pub fn new(kind: TransportKind, peer: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::next(),
            kind,
            peer,
            alive: AtomicBool::new(true),
            closed: Mutex::new(ClosedSlot::Open(None)),
            secondary: Mutex::new(SecondarySlot::Pending(Vec::new())),
            packet_handlers: RwLock::new(FxHashMap::default()),
        }
    }

    /// Returns the connection ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the transport kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Returns the remote address.
    #[inline]
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Returns `true` until [`finish`](Self::finish) has run.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Returns the close reason once closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        match *self.closed.lock() {
            ClosedSlot::Open(_) => None,
            ClosedSlot::Closed(reason) => Some(reason),
        }
    }
}

// ============================================================================
// ConnectionCore - Closed Notification
// ============================================================================

impl ConnectionCore {
    /// Ends the lifecycle and fires the closed notification.
    ///
    /// Returns `true` for the call that actually closed the connection and
    /// `false` for every later call.
    pub fn finish(&self, reason: CloseReason) -> bool {
        if self
            .alive
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let handler = match mem::replace(&mut *self.closed.lock(), ClosedSlot::Closed(reason)) {
            ClosedSlot::Open(handler) => handler,
            ClosedSlot::Closed(_) => None,
        };

        trace!(connection_id = %self.id, kind = %self.kind, %reason, "Connection finished");

        if let Some(handler) = handler {
            handler(reason);
        }
        true
    }

    /// Subscribes to the closed notification.
    ///
    /// If the connection already closed, `handler` runs immediately.
    pub fn on_closed(&self, handler: ClosedHandler) {
        let reason = {
            let mut slot = self.closed.lock();
            match *slot {
                ClosedSlot::Open(ref mut current) => {
                    *current = Some(handler);
                    return;
                }
                ClosedSlot::Closed(reason) => reason,
            }
        };
        handler(reason);
    }
}

// ============================================================================
// ConnectionCore - Secondary Hook
// ============================================================================

impl ConnectionCore {
    /// Binds the secondary bootstrap handler and flushes queued bootstraps.
    pub fn on_secondary(&self, handler: SecondaryHandler) {
        let queued = {
            let mut slot = self.secondary.lock();
            match mem::replace(&mut *slot, SecondarySlot::Bound(Arc::clone(&handler))) {
                SecondarySlot::Pending(queued) => queued,
                SecondarySlot::Bound(_) => Vec::new(),
                SecondarySlot::Detached => {
                    *slot = SecondarySlot::Detached;
                    return;
                }
            }
        };

        for (primary, secondary) in queued {
            handler(primary, secondary);
        }
    }

    /// Reports a bootstrapped secondary owned by `primary`.
    ///
    /// Called by primary transports once the secondary handshake completed.
    /// A detached owner refuses the secondary and closes it.
    pub fn secondary_established(&self, primary: ConnectionHandle, secondary: ConnectionHandle) {
        let route = {
            let mut slot = self.secondary.lock();
            match &mut *slot {
                SecondarySlot::Bound(handler) => Route::Deliver(Arc::clone(handler)),
                SecondarySlot::Pending(queued) => {
                    queued.push((Arc::clone(&primary), Arc::clone(&secondary)));
                    Route::Queued
                }
                SecondarySlot::Detached => Route::Refuse,
            }
        };

        match route {
            Route::Deliver(handler) => handler(primary, secondary),
            Route::Queued => {
                debug!(connection_id = %self.id, "Secondary queued until handler is bound");
            }
            Route::Refuse => secondary.close(CloseReason::OwnerClosed, true),
        }
    }
}

// ============================================================================
// ConnectionCore - Packets & Detach
// ============================================================================

impl ConnectionCore {
    /// Routes inbound packets of `kind` to `handler`, replacing any previous one.
    pub fn add_packet_handler(&self, kind: &str, handler: PacketHandler) {
        self.packet_handlers.write().insert(kind.to_owned(), handler);
    }

    /// Returns `true` if a handler is registered for `kind`.
    #[must_use]
    pub fn handles(&self, kind: &str) -> bool {
        self.packet_handlers.read().contains_key(kind)
    }

    /// Delivers an inbound packet to its handler.
    pub fn dispatch(&self, packet: Packet) {
        let handler = self.packet_handlers.read().get(&packet.kind).cloned();
        match handler {
            Some(handler) => handler(self.id, packet),
            None => {
                debug!(connection_id = %self.id, kind = %packet.kind, "No handler for packet kind");
            }
        }
    }

    /// Drops all subscriptions so the connection can be released.
    ///
    /// Secondaries still queued for this owner are closed.
    pub fn detach(&self) {
        let closed_handler = match &mut *self.closed.lock() {
            ClosedSlot::Open(handler) => handler.take(),
            ClosedSlot::Closed(_) => None,
        };
        drop(closed_handler);

        let queued = match mem::replace(&mut *self.secondary.lock(), SecondarySlot::Detached) {
            SecondarySlot::Pending(queued) => queued,
            _ => Vec::new(),
        };
        for (_, secondary) in queued {
            secondary.close(CloseReason::OwnerClosed, true);
        }

        self.packet_handlers.write().clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
