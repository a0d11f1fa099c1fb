//! Connection event hub.
//!
//! Multicasts `Established` and `Lost` to any number of subscribers. Two
//! subscription styles are offered:
//!
//! - Callbacks ([`EventHub::subscribe_established`], [`EventHub::subscribe_lost`]),
//!   invoked synchronously on the thread that produced the event
//! - A channel ([`EventHub::subscribe`]) yielding [`ServerEvent`]s for async
//!   consumers
//!
//! Dispatch snapshots the subscriber list and calls subscribers outside the
//! lock, so a subscriber may subscribe or unsubscribe from inside a callback.
//! A channel whose receiver was dropped is removed on the next event.
//!
//! # Ordering
//!
//! For one connection, `Established` is always delivered before `Lost`. For a
//! primary, `Lost` is delivered after `Lost` of every secondary it owned.
//! Callbacks must not block; they run on connection I/O tasks. A callback that
//! closes connections of another primary should do so from a spawned task.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use crate::identifiers::SubscriptionId;
use crate::protocol::CloseReason;
use crate::transport::{ConnectionHandle, TransportKind};

// ============================================================================
// Types
// ============================================================================

/// Callback for `Established` events.
pub type EstablishedHandler = Arc<dyn Fn(&ConnectionHandle, TransportKind) + Send + Sync>;

/// Callback for `Lost` events.
pub type LostHandler = Arc<dyn Fn(&ConnectionHandle, TransportKind, CloseReason) + Send + Sync>;

/// An event delivered through [`EventHub::subscribe`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was registered.
    Established {
        /// The new connection.
        connection: ConnectionHandle,
        /// Its transport kind.
        kind: TransportKind,
    },

    /// A connection was removed.
    Lost {
        /// The removed connection.
        connection: ConnectionHandle,
        /// Its transport kind.
        kind: TransportKind,
        /// Why it closed.
        reason: CloseReason,
    },
}

impl ServerEvent {
    /// Returns the connection the event is about.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        match self {
            Self::Established { connection, .. } | Self::Lost { connection, .. } => connection,
        }
    }

    /// Returns the transport kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Established { kind, .. } | Self::Lost { kind, .. } => *kind,
        }
    }
}

// ============================================================================
// EventHub
// ============================================================================

/// Multicast dispatcher for connection events.
#[derive(Default)]
pub struct EventHub {
    established: RwLock<Vec<(SubscriptionId, EstablishedHandler)>>,
    lost: RwLock<Vec<(SubscriptionId, LostHandler)>>,
    channels: RwLock<Vec<(SubscriptionId, mpsc::UnboundedSender<ServerEvent>)>>,
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("established", &self.established.read().len())
            .field("lost", &self.lost.read().len())
            .field("channels", &self.channels.read().len())
            .finish()
    }
}

impl EventHub {
    /// Creates a hub with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a callback to `Established` events.
    pub fn subscribe_established<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionHandle, TransportKind) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.established.write().push((id, Arc::new(handler)));
        id
    }

    /// Subscribes a callback to `Lost` events.
    pub fn subscribe_lost<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionHandle, TransportKind, CloseReason) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.lost.write().push((id, Arc::new(handler)));
        id
    }

    /// Subscribes to both events through an unbounded channel.
    ///
    /// The subscription ends on [`unsubscribe`](Self::unsubscribe) or with
    /// the first event after the receiver is dropped.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId::next();
        self.channels.write().push((id, tx));
        (id, rx)
    }

    /// Removes a subscription. Returns `true` if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;

        let mut established = self.established.write();
        let before = established.len();
        established.retain(|(sub, _)| *sub != id);
        removed |= established.len() != before;
        drop(established);

        let mut lost = self.lost.write();
        let before = lost.len();
        lost.retain(|(sub, _)| *sub != id);
        removed |= lost.len() != before;
        drop(lost);

        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|(sub, _)| *sub != id);
        removed |= channels.len() != before;

        removed
    }

    /// Number of distinct subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let established = self.established.read();
        let lost = self.lost.read();
        let shared = established
            .iter()
            .filter(|(id, _)| lost.iter().any(|(other, _)| other == id))
            .count();
        established.len() + lost.len() - shared + self.channels.read().len()
    }

    /// Sends `event` to every channel, dropping those whose receiver is gone.
    fn deliver(&self, event: &ServerEvent) {
        let channels: Vec<_> = self
            .channels
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut gone = Vec::new();
        for (id, tx) in channels {
            if tx.send(event.clone()).is_err() {
                gone.push(id);
            }
        }

        if !gone.is_empty() {
            trace!(closed = gone.len(), "Pruning event channels");
            self.channels.write().retain(|(id, _)| !gone.contains(id));
        }
    }

    /// Delivers `Established` to every subscriber.
    pub(crate) fn emit_established(&self, connection: &ConnectionHandle, kind: TransportKind) {
        let handlers: Vec<_> = self
            .established
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        trace!(connection_id = %connection.id(), %kind, subscribers = handlers.len(), "Established");

        for handler in handlers {
            handler(connection, kind);
        }

        self.deliver(&ServerEvent::Established {
            connection: Arc::clone(connection),
            kind,
        });
    }

    /// Delivers `Lost` to every subscriber.
    pub(crate) fn emit_lost(
        &self,
        connection: &ConnectionHandle,
        kind: TransportKind,
        reason: CloseReason,
    ) {
        let handlers: Vec<_> = self
            .lost
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        trace!(connection_id = %connection.id(), %kind, %reason, subscribers = handlers.len(), "Lost");

        for handler in handlers {
            handler(connection, kind, reason);
        }

        self.deliver(&ServerEvent::Lost {
            connection: Arc::clone(connection),
            kind,
            reason,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
