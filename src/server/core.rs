//! Connection server orchestrator.
//!
//! [`ConnectionServer`] wires the listeners, the registry, the admission policy
//! and the event hub together, and runs the cascade when a connection closes.
//!
//! # Primary Lifecycle
//!
//! ```text
//! accept ─► handshake ─► register ─► packet handlers ─► Established
//!                                                         │
//!                           bind on_closed + on_secondary ◄┘
//!
//! closed(reason) ─► [family lane] unregister primary + owned set
//!                                 close every orphan with `reason`
//!                                 Lost(secondary) for each orphan
//!                                 Lost(primary)
//! ```
//!
//! # Secondary Admission
//!
//! | Admission | Effect |
//! |-----------|--------|
//! | `Admitted` | `Established(secondary)`, cascade handler bound |
//! | `Rejected(NotPermitted)` | secondary closed, primary untouched |
//! | `Rejected(LimitExceeded)` | secondary closed, then primary closed (cascades) |
//! | `OwnerNotFound` | secondary closed with `OwnerClosed` |
//!
//! # Example
//!
//! ```ignore
//! use connection_hub::{ConnectionServer, Packet, TransportKind};
//!
//! let server = ConnectionServer::builder().port(7777).spawn().await?;
//!
//! server.on_lost(|connection, kind, reason| {
//!     tracing::info!(id = %connection.id(), %kind, %reason, "gone");
//! });
//!
//! server.broadcast(TransportKind::Primary, &Packet::empty("tick"));
//! server.shutdown().await;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, SubscriptionId};
use crate::protocol::{CloseReason, Packet, PacketHandler};
use crate::transport::{
    Connection, ConnectionHandle, StreamAcceptor, TertiaryListener, TertiaryTransport,
    TransportKind, upgrade,
};

use super::builder::ServerBuilder;
use super::events::{EventHub, ServerEvent};
use super::listener::{ListenerLoop, ListenerState};
use super::options::{ServerOptions, Settings};
use super::registry::{Admission, ConnectionRegistry, Removal};

// ============================================================================
// Types
// ============================================================================

/// Outcome of [`ConnectionServer::broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the packet was handed to.
    pub delivered: usize,
    /// Connections whose send failed.
    pub skipped: usize,
}

/// Internal shared state for the server.
pub(crate) struct ServerInner {
    /// Instance ID carried in log fields.
    instance: Uuid,

    /// Primary listener bind address.
    bind_ip: IpAddr,

    /// Configured primary port (0 = OS assigned).
    port: u16,

    /// WebSocket handshake timeout.
    handshake_timeout: Duration,

    /// Runtime admission settings.
    settings: Settings,

    /// Live connections.
    registry: ConnectionRegistry,

    /// Event subscribers.
    events: EventHub,

    /// Packet handlers applied to every new connection.
    packet_handlers: RwLock<Vec<(String, PacketHandler)>>,

    /// Primary accept loop.
    primary_listener: ListenerLoop,

    /// Tertiary accept loop.
    tertiary_listener: ListenerLoop,

    /// Installed tertiary transport, if any.
    tertiary_transport: Option<Arc<dyn TertiaryTransport>>,

    /// Address of the running primary listener.
    local_addr: Mutex<Option<SocketAddr>>,
}

// ============================================================================
// ConnectionServer
// ============================================================================

/// Multi-transport connection server.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ConnectionServer {
    /// Shared inner state.
    pub(crate) inner: Arc<ServerInner>,
}

impl fmt::Debug for ConnectionServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionServer")
            .field("instance", &self.inner.instance)
            .field("local_addr", &self.local_addr())
            .field("connection_count", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ConnectionServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = &self.inner.registry;
        write!(f, "ConnectionServer[")?;
        match self.local_addr() {
            Some(addr) => write!(f, "{addr}")?,
            None => write!(f, "{}:{}", self.inner.bind_ip, self.inner.port)?,
        }
        write!(
            f,
            "] primary={} ({}), secondary={} (limit {}{}), tertiary={} ({})",
            registry.count(TransportKind::Primary),
            self.inner.primary_listener.state(),
            registry.count(TransportKind::Secondary),
            self.secondary_limit(),
            if self.allow_secondary() { "" } else { ", disabled" },
            registry.count(TransportKind::Tertiary),
            if self.allow_tertiary() {
                self.inner.tertiary_listener.state().as_str()
            } else {
                "disabled"
            },
        )
    }
}

// ============================================================================
// ConnectionServer - Construction
// ============================================================================

impl ConnectionServer {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Creates a stopped server from options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn new(options: ServerOptions) -> Result<Self> {
        Self::with_transport(options, None)
    }

    /// Creates a stopped server with an optional tertiary transport.
    pub(crate) fn with_transport(
        options: ServerOptions,
        tertiary_transport: Option<Arc<dyn TertiaryTransport>>,
    ) -> Result<Self> {
        options.validate()?;

        let inner = ServerInner {
            instance: Uuid::new_v4(),
            bind_ip: options.bind_ip,
            port: options.port,
            handshake_timeout: options.handshake_timeout(),
            settings: Settings::from_options(&options),
            registry: ConnectionRegistry::new(),
            events: EventHub::new(),
            packet_handlers: RwLock::new(Vec::new()),
            primary_listener: ListenerLoop::new(TransportKind::Primary),
            tertiary_listener: ListenerLoop::new(TransportKind::Tertiary),
            tertiary_transport,
            local_addr: Mutex::new(None),
        };

        debug!(server = %inner.instance, bind_ip = %inner.bind_ip, port = inner.port, "Server created");

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Returns the instance ID used in logs.
    #[inline]
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance
    }
}

// ============================================================================
// ConnectionServer - Listener Control
// ============================================================================

impl ConnectionServer {
    /// Starts the primary listener and, if enabled and supported, the tertiary
    /// listener.
    ///
    /// A tertiary listener that fails to start is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the primary listener cannot bind.
    pub async fn start(&self) -> Result<()> {
        self.start_primary_listener().await?;

        if self.allow_tertiary()
            && let Err(e) = self.start_tertiary_listener().await
        {
            warn!(server = %self.inner.instance, error = %e, "Tertiary listener failed to start");
        }

        info!(server = %self.inner.instance, addr = ?self.local_addr(), "Server started");
        Ok(())
    }

    /// Stops both listeners. Live connections stay open.
    pub async fn stop(&self) {
        self.stop_primary_listener().await;
        self.stop_tertiary_listener().await;
        info!(server = %self.inner.instance, "Server stopped");
    }

    /// Stops both listeners and closes every connection with
    /// [`CloseReason::ServerClosed`].
    pub async fn shutdown(&self) {
        self.stop().await;
        self.close_all(CloseReason::ServerClosed);
        info!(server = %self.inner.instance, "Server shut down");
    }

    /// Starts the primary listener.
    ///
    /// Returns `false` if it was already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn start_primary_listener(&self) -> Result<bool> {
        let weak = Arc::downgrade(&self.inner);

        self.inner
            .primary_listener
            .start(self.inner.bind_primary(), move |(stream, peer): (TcpStream, SocketAddr)| {
                if let Some(inner) = weak.upgrade() {
                    tokio::spawn(inner.handle_stream(stream, peer));
                }
            })
            .await
    }

    /// Stops the primary listener. Returns `false` if it was not running.
    pub async fn stop_primary_listener(&self) -> bool {
        let stopped = self.inner.primary_listener.stop().await;
        if stopped {
            *self.inner.local_addr.lock() = None;
        }
        stopped
    }

    /// Starts the tertiary listener.
    ///
    /// Returns `false` without starting when it is already running, when
    /// tertiaries are disabled, when no tertiary transport is installed, or
    /// when the transport is unsupported on this platform.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the transport fails to open its listener.
    pub async fn start_tertiary_listener(&self) -> Result<bool> {
        let instance = self.inner.instance;

        if !self.allow_tertiary() {
            debug!(server = %instance, "Tertiary disabled, listener not started");
            return Ok(false);
        }
        let Some(transport) = self.inner.tertiary_transport.clone() else {
            debug!(server = %instance, "No tertiary transport installed");
            return Ok(false);
        };
        if !transport.is_supported() {
            warn!(server = %instance, transport = transport.name(), "Tertiary transport unsupported on this platform");
            return Ok(false);
        }

        let backlog = self.inner.settings.tertiary_backlog();
        let weak = Arc::downgrade(&self.inner);

        self.inner
            .tertiary_listener
            .start(bind_tertiary(transport, backlog), move |connection: ConnectionHandle| {
                if let Some(inner) = weak.upgrade()
                    && let Err(e) = inner.attach_tertiary(connection)
                {
                    warn!(server = %inner.instance, error = %e, "Tertiary attach failed");
                }
            })
            .await
    }

    /// Stops the tertiary listener. Returns `false` if it was not running.
    pub async fn stop_tertiary_listener(&self) -> bool {
        self.inner.tertiary_listener.stop().await
    }

    /// Returns `true` while the primary listener accepts.
    #[inline]
    #[must_use]
    pub fn is_primary_listening(&self) -> bool {
        self.inner.primary_listener.is_listening()
    }

    /// Returns `true` while the tertiary listener accepts.
    #[inline]
    #[must_use]
    pub fn is_tertiary_listening(&self) -> bool {
        self.inner.tertiary_listener.is_listening()
    }

    /// Returns the listener state for `kind`.
    ///
    /// Secondaries have no listener and always report `Stopped`.
    #[must_use]
    pub fn listener_state(&self, kind: TransportKind) -> ListenerState {
        match kind {
            TransportKind::Primary => self.inner.primary_listener.state(),
            TransportKind::Tertiary => self.inner.tertiary_listener.state(),
            TransportKind::Secondary => ListenerState::Stopped,
        }
    }

    /// Returns the bound primary address while listening.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }
}

// ============================================================================
// ConnectionServer - Settings
// ============================================================================

impl ConnectionServer {
    /// Whether secondaries are accepted.
    #[inline]
    #[must_use]
    pub fn allow_secondary(&self) -> bool {
        self.inner.settings.allow_secondary()
    }

    /// Enables or disables secondaries for future admissions.
    #[inline]
    pub fn set_allow_secondary(&self, allow: bool) {
        self.inner.settings.set_allow_secondary(allow);
    }

    /// Maximum secondaries per primary.
    #[inline]
    #[must_use]
    pub fn secondary_limit(&self) -> usize {
        self.inner.settings.secondary_limit()
    }

    /// Sets the per-primary secondary limit for future admissions.
    #[inline]
    pub fn set_secondary_limit(&self, limit: usize) {
        self.inner.settings.set_secondary_limit(limit);
    }

    /// Whether tertiaries are accepted.
    #[inline]
    #[must_use]
    pub fn allow_tertiary(&self) -> bool {
        self.inner.settings.allow_tertiary()
    }

    /// Enables or disables tertiaries.
    ///
    /// Does not start or stop the tertiary listener; see
    /// [`start_tertiary_listener`](Self::start_tertiary_listener).
    #[inline]
    pub fn set_allow_tertiary(&self, allow: bool) {
        self.inner.settings.set_allow_tertiary(allow);
    }

    /// Tertiary pending-connection queue depth.
    #[inline]
    #[must_use]
    pub fn tertiary_backlog(&self) -> u32 {
        self.inner.settings.tertiary_backlog()
    }

    /// Sets the tertiary backlog used by the next listener start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `backlog` is zero.
    #[inline]
    pub fn set_tertiary_backlog(&self, backlog: u32) -> Result<()> {
        self.inner.settings.set_tertiary_backlog(backlog)
    }
}

// ============================================================================
// ConnectionServer - Events & Hooks
// ============================================================================

impl ConnectionServer {
    /// Returns the event hub.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    /// Subscribes a callback to `Established` events.
    pub fn on_established<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionHandle, TransportKind) + Send + Sync + 'static,
    {
        self.inner.events.subscribe_established(handler)
    }

    /// Subscribes a callback to `Lost` events.
    pub fn on_lost<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionHandle, TransportKind, CloseReason) + Send + Sync + 'static,
    {
        self.inner.events.subscribe_lost(handler)
    }

    /// Subscribes to all events through a channel.
    #[inline]
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ServerEvent>) {
        self.inner.events.subscribe()
    }

    /// Removes a subscription.
    #[inline]
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Registers a packet handler applied to every connection accepted from
    /// now on, on every transport.
    pub fn register_packet_handler(&self, kind: impl Into<String>, handler: PacketHandler) {
        let kind = kind.into();
        debug!(server = %self.inner.instance, %kind, "Packet handler registered");

        let mut handlers = self.inner.packet_handlers.write();
        handlers.retain(|(existing, _)| *existing != kind);
        handlers.push((kind, handler));
    }
}

// ============================================================================
// ConnectionServer - Queries
// ============================================================================

impl ConnectionServer {
    /// Snapshot of all primaries.
    #[inline]
    #[must_use]
    pub fn primaries(&self) -> Vec<ConnectionHandle> {
        self.inner.registry.primaries()
    }

    /// Snapshot of all secondaries.
    #[inline]
    #[must_use]
    pub fn secondaries(&self) -> Vec<ConnectionHandle> {
        self.inner.registry.secondaries()
    }

    /// Snapshot of all tertiaries.
    #[inline]
    #[must_use]
    pub fn tertiaries(&self) -> Vec<ConnectionHandle> {
        self.inner.registry.tertiaries()
    }

    /// Number of live connections of all kinds.
    ///
    /// Tertiaries are included; secondaries too, even though each one rides
    /// on a primary. Use [`count`](Self::count) for a single kind.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Number of live connections of one kind.
    #[inline]
    #[must_use]
    pub fn count(&self, kind: TransportKind) -> usize {
        self.inner.registry.count(kind)
    }

    /// Secondaries owned by a primary, or `None` if it is not registered.
    #[inline]
    #[must_use]
    pub fn secondaries_of(&self, primary_id: ConnectionId) -> Option<Vec<ConnectionHandle>> {
        self.inner.registry.lookup(primary_id)
    }

    /// The primary owning a secondary.
    #[inline]
    #[must_use]
    pub fn owner_of(&self, secondary_id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.registry.owner_of(secondary_id)
    }

    /// A live connection of any kind.
    #[inline]
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.registry.get(id)
    }
}

// ============================================================================
// ConnectionServer - Commands
// ============================================================================

impl ConnectionServer {
    /// Registers an externally created primary and announces it.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the connection is not a primary
    /// - [`Error::DuplicateConnection`] if it is already registered
    pub fn attach_primary(&self, connection: ConnectionHandle) -> Result<()> {
        self.inner.attach_primary(connection)
    }

    /// Adds an externally created tertiary to the pool.
    ///
    /// Returns `Rejected(NotPermitted)` and closes the connection when
    /// tertiaries are disabled.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the connection is not a tertiary
    /// - [`Error::DuplicateConnection`] if it is already pooled
    pub fn attach_tertiary(&self, connection: ConnectionHandle) -> Result<Admission> {
        self.inner.attach_tertiary(connection)
    }

    /// Closes every connection.
    ///
    /// Primaries are closed first so their secondaries go down with them.
    pub fn close_all(&self, reason: CloseReason) {
        for kind in TransportKind::ALL {
            self.close_all_of_kind(kind, reason);
        }
    }

    /// Closes every connection of one kind. Returns how many were closed.
    ///
    /// Closing primaries cascades to their secondaries; closing secondaries
    /// leaves their owners open.
    pub fn close_all_of_kind(&self, kind: TransportKind, reason: CloseReason) -> usize {
        let targets = self.inner.registry.of_kind(kind);
        let count = targets.len();

        for connection in targets {
            connection.close(reason, true);
        }

        if count > 0 {
            info!(server = %self.inner.instance, %kind, %reason, count, "Closed connections");
        }
        count
    }

    /// Sends `packet` to every live connection of `kind`.
    ///
    /// Works on a snapshot; a failed send is counted and skipped.
    pub fn broadcast(&self, kind: TransportKind, packet: &Packet) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for connection in self.inner.registry.of_kind(kind) {
            match connection.send(packet) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    if e.is_recoverable() {
                        trace!(connection_id = %connection.id(), error = %e, "Broadcast send skipped");
                    } else {
                        warn!(connection_id = %connection.id(), error = %e, "Broadcast send failed");
                    }
                    report.skipped += 1;
                }
            }
        }

        report
    }
}

// ============================================================================
// ServerInner - Accept Paths
// ============================================================================

impl ServerInner {
    /// Binds the primary acceptor and records its address.
    async fn bind_primary(&self) -> Result<StreamAcceptor> {
        let acceptor = StreamAcceptor::bind(self.bind_ip, self.port).await?;
        *self.local_addr.lock() = Some(acceptor.local_addr());
        Ok(acceptor)
    }

    /// Handshakes one accepted TCP stream and attaches it.
    async fn handle_stream(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let local_ip = stream
            .local_addr()
            .map(|addr| addr.ip())
            .unwrap_or(self.bind_ip);

        match upgrade(stream, peer, local_ip, self.handshake_timeout).await {
            Ok(connection) => self.admit_upgraded(connection),
            Err(e) if e.is_timeout() => {
                debug!(server = %self.instance, %peer, error = %e, "Primary handshake timed out");
            }
            Err(e) if e.is_connection_error() => {
                debug!(server = %self.instance, %peer, error = %e, "Primary handshake failed");
            }
            Err(e) => {
                warn!(server = %self.instance, %peer, error = %e, "Primary handshake error");
            }
        }
    }

    /// Attaches a freshly upgraded primary unless the listener went away
    /// during its handshake.
    ///
    /// Checked again after attaching: a `shutdown` whose `close_all` ran
    /// before the registration would otherwise leave the primary open.
    fn admit_upgraded(self: &Arc<Self>, connection: ConnectionHandle) {
        if !self.primary_listener.is_listening() {
            debug!(server = %self.instance, connection_id = %connection.id(), "Listener stopped during handshake");
            connection.close(CloseReason::ServerClosed, true);
            return;
        }

        if let Err(e) = self.attach_primary(Arc::clone(&connection)) {
            if e.is_invariant_violation() {
                error!(server = %self.instance, connection_id = %connection.id(), error = %e, "Primary attach failed");
            } else {
                warn!(server = %self.instance, connection_id = %connection.id(), error = %e, "Primary attach failed");
            }
            connection.close(CloseReason::ServerClosed, true);
            return;
        }

        if !self.primary_listener.is_listening() {
            connection.close(CloseReason::ServerClosed, true);
        }
    }

    /// Installs the registered packet handlers on a connection.
    fn apply_packet_handlers(&self, connection: &ConnectionHandle) {
        for (kind, handler) in self.packet_handlers.read().iter() {
            connection.add_packet_handler(kind, Arc::clone(handler));
        }
    }

    fn attach_primary(self: &Arc<Self>, connection: ConnectionHandle) -> Result<()> {
        let id = connection.id();
        if connection.kind() != TransportKind::Primary {
            return Err(Error::connection(format!(
                "{id} is a {} connection, expected primary",
                connection.kind()
            )));
        }

        self.registry.register_primary(Arc::clone(&connection))?;
        self.apply_packet_handlers(&connection);
        self.events.emit_established(&connection, TransportKind::Primary);

        info!(server = %self.instance, connection_id = %id, peer = ?connection.peer_addr(), "Primary established");

        // Bound after Established so Lost can never overtake it
        let weak = Arc::downgrade(self);
        let handle = Arc::downgrade(&connection);
        connection.on_closed(Box::new(move |reason| {
            if let (Some(inner), Some(connection)) = (weak.upgrade(), handle.upgrade()) {
                inner.primary_closed(&connection, reason);
            }
        }));

        let weak = Arc::downgrade(self);
        connection.on_secondary(Arc::new(move |primary: ConnectionHandle, secondary: ConnectionHandle| {
            match weak.upgrade() {
                Some(inner) => inner.admit_secondary(&primary, secondary),
                None => secondary.close(CloseReason::ServerClosed, true),
            }
        }));

        Ok(())
    }

    fn admit_secondary(self: &Arc<Self>, primary: &ConnectionHandle, secondary: ConnectionHandle) {
        let primary_id = primary.id();
        let secondary_id = secondary.id();

        let Some(lane) = self.registry.lane(primary_id) else {
            debug!(server = %self.instance, connection_id = %secondary_id, owner = %primary_id, "Secondary owner already gone");
            secondary.close(CloseReason::OwnerClosed, true);
            return;
        };
        let _lane = lane.lock();

        let admission = match self.registry.register_secondary(
            primary_id,
            Arc::clone(&secondary),
            self.settings.allow_secondary(),
            self.settings.secondary_limit(),
        ) {
            Ok(admission) => admission,
            Err(e) => {
                error!(server = %self.instance, connection_id = %secondary_id, error = %e, "Secondary registration failed");
                return;
            }
        };

        match admission {
            Admission::Admitted => {
                self.apply_packet_handlers(&secondary);
                self.events.emit_established(&secondary, TransportKind::Secondary);

                info!(server = %self.instance, connection_id = %secondary_id, owner = %primary_id, "Secondary established");

                let weak = Arc::downgrade(self);
                let handle = Arc::downgrade(&secondary);
                secondary.on_closed(Box::new(move |reason| {
                    if let (Some(inner), Some(connection)) = (weak.upgrade(), handle.upgrade()) {
                        inner.secondary_closed(&connection, reason);
                    }
                }));
            }

            Admission::Rejected(reject) => {
                let reason = reject.close_reason();
                warn!(
                    server = %self.instance,
                    connection_id = %secondary_id,
                    owner = %primary_id,
                    %reject,
                    "Secondary rejected"
                );

                secondary.close(reason, true);
                if reject.closes_owner() {
                    primary.close(reason, true);
                }
            }

            Admission::OwnerNotFound => {
                debug!(server = %self.instance, connection_id = %secondary_id, owner = %primary_id, "Secondary owner already gone");
                secondary.close(CloseReason::OwnerClosed, true);
            }
        }
    }

    fn attach_tertiary(self: &Arc<Self>, connection: ConnectionHandle) -> Result<Admission> {
        let id = connection.id();
        if connection.kind() != TransportKind::Tertiary {
            return Err(Error::connection(format!(
                "{id} is a {} connection, expected tertiary",
                connection.kind()
            )));
        }

        let admission = self
            .registry
            .register_tertiary(Arc::clone(&connection), self.settings.allow_tertiary())?;

        match admission {
            Admission::Admitted => {
                self.apply_packet_handlers(&connection);
                self.events.emit_established(&connection, TransportKind::Tertiary);

                info!(server = %self.instance, connection_id = %id, "Tertiary established");

                let weak = Arc::downgrade(self);
                let handle = Arc::downgrade(&connection);
                connection.on_closed(Box::new(move |reason| {
                    if let (Some(inner), Some(connection)) = (weak.upgrade(), handle.upgrade()) {
                        inner.tertiary_closed(&connection, reason);
                    }
                }));
            }
            Admission::Rejected(reject) => {
                debug!(server = %self.instance, connection_id = %id, %reject, "Tertiary rejected");
                connection.close(reject.close_reason(), true);
            }
            Admission::OwnerNotFound => {}
        }

        Ok(admission)
    }
}

// ============================================================================
// ServerInner - Cascade
// ============================================================================

impl ServerInner {
    /// Closed handler of a primary: tears down its whole family.
    fn primary_closed(&self, connection: &ConnectionHandle, reason: CloseReason) {
        let id = connection.id();
        let lane = self.registry.lane(id);
        let _lane = lane.as_ref().map(|lane| lane.lock());

        let orphans = match self.registry.unregister(id) {
            Removal::Primary { orphans } => orphans,
            other => {
                let e = Error::connection_not_found(id);
                error!(server = %self.instance, error = %e, removal = ?other, "Cascade on unregistered primary");
                return;
            }
        };

        // Orphans are already out of the registry; their own handlers find
        // nothing to remove and stay silent
        for orphan in &orphans {
            orphan.close(reason, true);
        }
        for orphan in &orphans {
            orphan.detach_handlers();
            self.events.emit_lost(orphan, TransportKind::Secondary, reason);
        }
        self.events.emit_lost(connection, TransportKind::Primary, reason);
        connection.detach_handlers();

        info!(
            server = %self.instance,
            connection_id = %id,
            %reason,
            secondaries = orphans.len(),
            "Primary lost"
        );
    }

    /// Closed handler of a secondary.
    fn secondary_closed(&self, connection: &ConnectionHandle, reason: CloseReason) {
        let id = connection.id();
        let lane = self.registry.owner_lane(id);
        let _lane = lane.as_ref().map(|lane| lane.lock());

        // Only the call that removed it reports it
        if let Removal::Secondary { owner } = self.registry.unregister(id) {
            self.events.emit_lost(connection, TransportKind::Secondary, reason);
            info!(server = %self.instance, connection_id = %id, %owner, %reason, "Secondary lost");
        }
        connection.detach_handlers();
    }

    /// Closed handler of a tertiary.
    fn tertiary_closed(&self, connection: &ConnectionHandle, reason: CloseReason) {
        let id = connection.id();

        match self.registry.unregister(id) {
            Removal::Tertiary => {
                self.events.emit_lost(connection, TransportKind::Tertiary, reason);
                info!(server = %self.instance, connection_id = %id, %reason, "Tertiary lost");
            }
            other => {
                let e = Error::connection_not_found(id);
                error!(server = %self.instance, error = %e, removal = ?other, "Cascade on unregistered tertiary");
            }
        }
        connection.detach_handlers();
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Opens a tertiary listener through the installed transport.
async fn bind_tertiary(
    transport: Arc<dyn TertiaryTransport>,
    backlog: u32,
) -> Result<Box<dyn TertiaryListener>> {
    let listener = transport.bind(backlog).await?;
    debug!(transport = transport.name(), backlog, "Tertiary listener bound");
    Ok(listener)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;
    use std::sync::Barrier;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    use crate::protocol::Frame;
    use crate::server::RejectReason;
    use crate::testing::{EventLog, MockConnection, MockTertiaryTransport, Recorded, init_tracing};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const WAIT: Duration = Duration::from_secs(5);

    fn server(options: ServerOptions) -> (ConnectionServer, EventLog) {
        let server = ConnectionServer::new(options.with_bind_ip(LOCALHOST)).expect("server");
        let log = EventLog::attach(server.events());
        (server, log)
    }

    fn attach(server: &ConnectionServer, primary: &Arc<MockConnection>) {
        server
            .attach_primary(Arc::clone(primary) as ConnectionHandle)
            .expect("attach primary");
    }

    fn bootstrap(primary: &Arc<MockConnection>) -> Arc<MockConnection> {
        let secondary = MockConnection::secondary();
        primary.bootstrap(&secondary);
        secondary
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("event in time")
            .expect("event")
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition in time");
    }

    // ------------------------------------------------------------------------
    // Cascade
    // ------------------------------------------------------------------------

    #[test]
    fn test_primary_loss_cascades_with_same_reason() {
        let (server, log) = server(ServerOptions::new().with_secondary_limit(3));
        let primary = MockConnection::primary();
        attach(&server, &primary);
        let secondaries: Vec<_> = (0..3).map(|_| bootstrap(&primary)).collect();
        assert_eq!(server.secondaries_of(primary.id()).map(|set| set.len()), Some(3));

        primary.remote_close(CloseReason::NetworkError);

        let lost = log.lost();
        assert_eq!(lost.len(), 4);
        assert!(lost.iter().all(|(_, _, reason)| *reason == CloseReason::NetworkError));
        assert_eq!(lost.last().map(|(id, kind, _)| (*id, *kind)), Some((primary.id(), TransportKind::Primary)));
        for secondary in &secondaries {
            assert_eq!(secondary.closed_with(), Some(CloseReason::NetworkError));
            assert_eq!(log.lost_count(secondary.id()), 1);
        }
        assert_eq!(server.connection_count(), 0);
        assert!(server.secondaries_of(primary.id()).is_none());
    }

    #[test]
    fn test_primary_without_secondaries_emits_single_lost() {
        let (server, log) = server(ServerOptions::new());
        let primary = MockConnection::primary();
        attach(&server, &primary);

        primary.remote_close(CloseReason::ClientClosed);

        assert_eq!(
            log.all(),
            vec![
                Recorded::Established(primary.id(), TransportKind::Primary),
                Recorded::Lost(primary.id(), TransportKind::Primary, CloseReason::ClientClosed),
            ]
        );
    }

    #[test]
    fn test_secondary_loss_keeps_owner() {
        let (server, log) = server(ServerOptions::new().with_secondary_limit(2));
        let primary = MockConnection::primary();
        attach(&server, &primary);
        let first = bootstrap(&primary);
        let second = bootstrap(&primary);

        first.remote_close(CloseReason::ClientClosed);

        assert!(primary.is_alive());
        assert_eq!(log.lost(), vec![(first.id(), TransportKind::Secondary, CloseReason::ClientClosed)]);
        assert!(server.owner_of(first.id()).is_none());
        assert_eq!(
            server.owner_of(second.id()).map(|owner| owner.id()),
            Some(primary.id())
        );

        server.close_all(CloseReason::ServerClosed);

        assert_eq!(log.lost_count(first.id()), 1);
        assert_eq!(log.lost_count(second.id()), 1);
        assert_eq!(log.lost_count(primary.id()), 1);
    }

    #[test]
    fn test_already_closed_primary_is_established_then_lost() {
        let (server, log) = server(ServerOptions::new());
        let primary = MockConnection::primary();
        primary.remote_close(CloseReason::Timeout);

        attach(&server, &primary);

        assert_eq!(
            log.all(),
            vec![
                Recorded::Established(primary.id(), TransportKind::Primary),
                Recorded::Lost(primary.id(), TransportKind::Primary, CloseReason::Timeout),
            ]
        );
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_bootstrap_after_owner_loss_closes_secondary() {
        let (server, log) = server(ServerOptions::new());
        let primary = MockConnection::primary();
        attach(&server, &primary);
        primary.remote_close(CloseReason::ClientClosed);

        let late = bootstrap(&primary);

        assert_eq!(late.closed_with(), Some(CloseReason::OwnerClosed));
        assert_eq!(log.established_count(late.id()), 0);
        assert_eq!(log.lost_count(late.id()), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_concurrent_family_close_reports_each_once() {
        for _ in 0..50 {
            let (server, log) = server(ServerOptions::new().with_secondary_limit(4));
            let primary = MockConnection::primary();
            attach(&server, &primary);
            let secondaries: Vec<_> = (0..4).map(|_| bootstrap(&primary)).collect();

            let barrier = Arc::new(Barrier::new(5));
            let mut threads = Vec::new();
            {
                let barrier = Arc::clone(&barrier);
                let primary = Arc::clone(&primary);
                threads.push(std::thread::spawn(move || {
                    barrier.wait();
                    primary.remote_close(CloseReason::NetworkError);
                }));
            }
            for secondary in &secondaries {
                let barrier = Arc::clone(&barrier);
                let secondary = Arc::clone(secondary);
                threads.push(std::thread::spawn(move || {
                    barrier.wait();
                    secondary.remote_close(CloseReason::ClientClosed);
                }));
            }
            for thread in threads {
                thread.join().expect("thread");
            }

            let primary_established = log.position(primary.id(), false).expect("primary established");
            let primary_lost = log.position(primary.id(), true).expect("primary lost");
            assert!(primary_established < primary_lost);
            for secondary in &secondaries {
                assert_eq!(log.lost_count(secondary.id()), 1);
                let secondary_lost = log.position(secondary.id(), true).expect("secondary lost");
                assert!(secondary_lost < primary_lost);
            }
            assert_eq!(log.lost_count(primary.id()), 1);
            assert_eq!(server.connection_count(), 0);
        }
    }

    #[test]
    fn test_bootstrap_racing_owner_close_is_consistent() {
        for _ in 0..200 {
            let (server, log) = server(ServerOptions::new());
            let primary = MockConnection::primary();
            attach(&server, &primary);
            let secondary = MockConnection::secondary();

            let barrier = Arc::new(Barrier::new(2));
            let bootstrapper = {
                let barrier = Arc::clone(&barrier);
                let primary = Arc::clone(&primary);
                let secondary = Arc::clone(&secondary);
                std::thread::spawn(move || {
                    barrier.wait();
                    primary.bootstrap(&secondary);
                })
            };
            let closer = {
                let barrier = Arc::clone(&barrier);
                let primary = Arc::clone(&primary);
                std::thread::spawn(move || {
                    barrier.wait();
                    primary.remote_close(CloseReason::NetworkError);
                })
            };
            bootstrapper.join().expect("bootstrap thread");
            closer.join().expect("close thread");

            assert_eq!(server.connection_count(), 0);
            assert!(!secondary.is_alive());

            let outcome = (
                log.established_count(secondary.id()),
                log.lost_count(secondary.id()),
                secondary.closed_with(),
            );
            assert!(
                outcome == (1, 1, Some(CloseReason::NetworkError))
                    || outcome == (0, 0, Some(CloseReason::OwnerClosed)),
                "unexpected secondary outcome {outcome:?}"
            );
            if outcome.0 == 1 {
                let secondary_lost = log.position(secondary.id(), true).expect("secondary lost");
                let primary_lost = log.position(primary.id(), true).expect("primary lost");
                assert!(secondary_lost < primary_lost);
            }
            assert_eq!(log.lost_count(primary.id()), 1);
        }
    }

    #[test]
    fn test_cascade_on_unregistered_connection_is_ignored() {
        let (server, log) = server(ServerOptions::new());
        let primary = MockConnection::primary();
        let tertiary = MockConnection::tertiary();

        server
            .inner
            .primary_closed(&(Arc::clone(&primary) as ConnectionHandle), CloseReason::ClientClosed);
        server
            .inner
            .tertiary_closed(&(Arc::clone(&tertiary) as ConnectionHandle), CloseReason::ClientClosed);

        assert!(log.all().is_empty());
        assert_eq!(primary.close_calls(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    // ------------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------------

    #[test]
    fn test_limit_exceeded_closes_owner_family() {
        let (server, log) = server(ServerOptions::new());
        let primary = MockConnection::primary();
        attach(&server, &primary);
        let first = bootstrap(&primary);
        assert_eq!(log.established_count(first.id()), 1);

        let second = bootstrap(&primary);

        let reason = CloseReason::SecondaryLimitExceeded;
        assert_eq!(second.closed_with(), Some(reason));
        assert_eq!(primary.closed_with(), Some(reason));
        assert_eq!(first.closed_with(), Some(reason));
        assert_eq!(
            log.lost(),
            vec![
                (first.id(), TransportKind::Secondary, reason),
                (primary.id(), TransportKind::Primary, reason),
            ]
        );
        assert_eq!(log.established_count(second.id()), 0);
        assert_eq!(second.close_calls(), 1);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_disabled_secondary_keeps_primary_open() {
        let (server, log) = server(ServerOptions::new().with_secondary(false));
        let primary = MockConnection::primary();
        attach(&server, &primary);

        let secondary = bootstrap(&primary);

        assert_eq!(secondary.closed_with(), Some(CloseReason::NotPermitted));
        assert!(primary.is_alive());
        assert_eq!(log.all(), vec![Recorded::Established(primary.id(), TransportKind::Primary)]);
        assert_eq!(server.count(TransportKind::Secondary), 0);
    }

    #[test]
    fn test_runtime_settings_apply_to_next_admission() {
        let (server, _log) = server(ServerOptions::new().with_secondary(false));
        let primary = MockConnection::primary();
        attach(&server, &primary);

        server.set_allow_secondary(true);
        server.set_secondary_limit(2);
        bootstrap(&primary);
        bootstrap(&primary);

        assert!(primary.is_alive());
        assert_eq!(server.count(TransportKind::Secondary), 2);
    }

    #[test]
    fn test_attach_rejects_wrong_kind_and_duplicates() {
        let (server, log) = server(ServerOptions::new().with_tertiary(true));
        let primary = MockConnection::primary();

        let wrong = server.attach_primary(MockConnection::secondary());
        assert!(matches!(wrong, Err(Error::Connection { .. })));
        let wrong = server.attach_tertiary(MockConnection::primary());
        assert!(matches!(wrong, Err(Error::Connection { .. })));

        attach(&server, &primary);
        let duplicate = server.attach_primary(Arc::clone(&primary) as ConnectionHandle);
        assert!(matches!(duplicate, Err(Error::DuplicateConnection { .. })));
        assert_eq!(log.established_count(primary.id()), 1);
    }

    // ------------------------------------------------------------------------
    // Tertiary Pool
    // ------------------------------------------------------------------------

    #[test]
    fn test_tertiary_disabled_by_default() {
        let (server, log) = server(ServerOptions::new());
        let tertiary = MockConnection::tertiary();

        let admission = server
            .attach_tertiary(Arc::clone(&tertiary) as ConnectionHandle)
            .expect("attach");

        assert_eq!(admission, Admission::Rejected(RejectReason::NotPermitted));
        assert!(server.tertiaries().is_empty());
        assert_eq!(tertiary.closed_with(), Some(CloseReason::NotPermitted));
        assert!(log.all().is_empty());
    }

    #[test]
    fn test_tertiary_lifecycle_events() {
        let (server, log) = server(ServerOptions::new().with_tertiary(true));
        let tertiary = MockConnection::tertiary();

        let admission = server
            .attach_tertiary(Arc::clone(&tertiary) as ConnectionHandle)
            .expect("attach");
        assert_eq!(admission, Admission::Admitted);
        assert_eq!(server.tertiaries().len(), 1);

        tertiary.remote_close(CloseReason::ClientClosed);

        assert_eq!(
            log.all(),
            vec![
                Recorded::Established(tertiary.id(), TransportKind::Tertiary),
                Recorded::Lost(tertiary.id(), TransportKind::Tertiary, CloseReason::ClientClosed),
            ]
        );
        assert!(server.tertiaries().is_empty());
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    #[test]
    fn test_broadcast_skips_closed_connections() {
        let (server, _log) = server(ServerOptions::new().with_secondary_limit(100));
        let primary = MockConnection::primary();
        attach(&server, &primary);
        let secondaries: Vec<_> = (0..100).map(|_| bootstrap(&primary)).collect();
        for secondary in secondaries.iter().take(3) {
            secondary.remote_close(CloseReason::ClientClosed);
        }

        let report = server.broadcast(TransportKind::Secondary, &Packet::empty("tick"));

        assert_eq!(report, BroadcastReport { delivered: 97, skipped: 0 });
        assert!(secondaries.iter().take(3).all(|secondary| secondary.sent().is_empty()));
        assert!(secondaries.iter().skip(3).all(|secondary| secondary.sent().len() == 1));
        assert!(primary.sent().is_empty());
    }

    #[test]
    fn test_broadcast_counts_failed_sends() {
        let (server, _log) = server(ServerOptions::new());
        let healthy = MockConnection::primary();
        let broken = MockConnection::primary();
        attach(&server, &healthy);
        attach(&server, &broken);
        broken.fail_sends();

        let report = server.broadcast(TransportKind::Primary, &Packet::empty("tick"));

        assert_eq!(report, BroadcastReport { delivered: 1, skipped: 1 });
        assert!(broken.is_alive());
    }

    #[test]
    fn test_close_all_of_kind_secondary_keeps_primaries() {
        let (server, log) = server(ServerOptions::new());
        let primaries: Vec<_> = (0..2).map(|_| MockConnection::primary()).collect();
        for primary in &primaries {
            attach(&server, primary);
            bootstrap(primary);
        }

        let closed = server.close_all_of_kind(TransportKind::Secondary, CloseReason::ServerClosed);

        assert_eq!(closed, 2);
        assert!(primaries.iter().all(|primary| primary.is_alive()));
        assert_eq!(server.count(TransportKind::Secondary), 0);
        assert_eq!(log.lost().len(), 2);
    }

    #[test]
    fn test_close_all_empties_registry() {
        let (server, log) = server(ServerOptions::new().with_tertiary(true));
        for _ in 0..2 {
            let primary = MockConnection::primary();
            attach(&server, &primary);
            bootstrap(&primary);
        }
        server
            .attach_tertiary(MockConnection::tertiary())
            .expect("tertiary");
        assert_eq!(server.connection_count(), 5);

        server.close_all(CloseReason::ServerClosed);

        assert_eq!(server.connection_count(), 0);
        let lost = log.lost();
        assert_eq!(lost.len(), 5);
        assert!(lost.iter().all(|(_, _, reason)| *reason == CloseReason::ServerClosed));
    }

    #[test]
    fn test_packet_handlers_apply_to_new_connections() {
        let (server, _log) = server(ServerOptions::new());
        server.register_packet_handler("ping", Arc::new(|_, _| {}));
        let primary = MockConnection::primary();
        attach(&server, &primary);
        let secondary = bootstrap(&primary);

        assert!(primary.core().handles("ping"));
        assert!(secondary.core().handles("ping"));
    }

    #[test]
    fn test_display_summarizes_state() {
        let (server, _log) = server(ServerOptions::new().with_port(4000));
        let primary = MockConnection::primary();
        attach(&server, &primary);
        bootstrap(&primary);

        let text = server.to_string();

        assert!(text.starts_with("ConnectionServer[127.0.0.1:4000]"));
        assert!(text.contains("primary=1 (stopped)"));
        assert!(text.contains("secondary=1 (limit 1)"));
        assert!(text.contains("tertiary=0 (disabled)"));
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_stop_start_leaves_single_primary_loop() {
        let server = ConnectionServer::builder()
            .bind_ip(LOCALHOST)
            .spawn()
            .await
            .expect("spawn");
        assert!(server.is_primary_listening());
        assert!(server.local_addr().is_some());

        assert!(server.stop_primary_listener().await);
        assert!(server.local_addr().is_none());
        assert_eq!(server.listener_state(TransportKind::Primary), ListenerState::Stopped);

        assert!(server.start_primary_listener().await.expect("restart"));
        assert!(!server.start_primary_listener().await.expect("second start"));
        assert_eq!(server.inner.primary_listener.active_loops(), 1);

        server.shutdown().await;
        assert_eq!(server.inner.primary_listener.active_loops(), 0);
    }

    #[test]
    fn test_upgraded_primary_refused_while_not_listening() {
        let (server, log) = server(ServerOptions::new());
        let primary = MockConnection::primary();

        server.inner.admit_upgraded(Arc::clone(&primary) as ConnectionHandle);

        assert_eq!(primary.closed_with(), Some(CloseReason::ServerClosed));
        assert_eq!(server.connection_count(), 0);
        assert!(log.all().is_empty());
    }

    #[tokio::test]
    async fn test_upgraded_primary_admitted_then_closed_by_shutdown() {
        let server = ConnectionServer::builder()
            .bind_ip(LOCALHOST)
            .spawn()
            .await
            .expect("spawn");
        let log = EventLog::attach(server.events());
        let primary = MockConnection::primary();

        server.inner.admit_upgraded(Arc::clone(&primary) as ConnectionHandle);
        assert!(primary.is_alive());
        assert_eq!(server.count(TransportKind::Primary), 1);

        server.shutdown().await;

        assert_eq!(primary.closed_with(), Some(CloseReason::ServerClosed));
        assert_eq!(log.lost_count(primary.id()), 1);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_tertiary_listener_accepts_into_pool() {
        let transport = MockTertiaryTransport::new(true);
        let server = ConnectionServer::builder()
            .bind_ip(LOCALHOST)
            .allow_tertiary(true)
            .tertiary_transport(Arc::clone(&transport) as Arc<dyn TertiaryTransport>)
            .spawn()
            .await
            .expect("spawn");
        assert!(server.is_tertiary_listening());
        assert_eq!(transport.last_backlog(), Some(15));

        assert!(transport.push(MockConnection::tertiary()));
        eventually(|| server.count(TransportKind::Tertiary) == 1).await;

        server.stop_tertiary_listener().await;
        server.set_tertiary_backlog(3).expect("backlog");
        assert!(server.start_tertiary_listener().await.expect("restart"));
        assert_eq!(transport.binds(), 2);
        assert_eq!(transport.last_backlog(), Some(3));
        assert_eq!(server.inner.tertiary_listener.active_loops(), 1);

        server.shutdown().await;
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_tertiary_listener_skipped_when_disabled_or_unsupported() {
        let disabled = MockTertiaryTransport::new(true);
        let server = ConnectionServer::builder()
            .bind_ip(LOCALHOST)
            .tertiary_transport(Arc::clone(&disabled) as Arc<dyn TertiaryTransport>)
            .spawn()
            .await
            .expect("spawn");
        assert!(server.is_primary_listening());
        assert!(!server.is_tertiary_listening());
        assert_eq!(disabled.binds(), 0);
        server.shutdown().await;

        let unsupported = MockTertiaryTransport::new(false);
        let server = ConnectionServer::builder()
            .bind_ip(LOCALHOST)
            .allow_tertiary(true)
            .tertiary_transport(Arc::clone(&unsupported) as Arc<dyn TertiaryTransport>)
            .spawn()
            .await
            .expect("spawn");
        assert!(!server.start_tertiary_listener().await.expect("start"));
        assert_eq!(unsupported.binds(), 0);
        server.shutdown().await;
    }

    // ------------------------------------------------------------------------
    // End to End
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_real_sockets_primary_secondary_lifecycle() {
        init_tracing();
        let server = ConnectionServer::builder()
            .bind_ip(LOCALHOST)
            .spawn()
            .await
            .expect("spawn");
        let (_subscription, mut events) = server.subscribe();

        let (packet_tx, mut packets) = mpsc::unbounded_channel();
        server.register_packet_handler(
            "echo",
            Arc::new(move |id, packet| {
                let _ = packet_tx.send((id, packet));
            }),
        );

        let addr = server.local_addr().expect("listening");
        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.expect("connect");

        let established = next_event(&mut events).await;
        assert_eq!(established.kind(), TransportKind::Primary);
        let primary_id = established.connection().id();

        // Primary packet
        let frame = Frame::Packet(Packet::empty("echo")).to_text().expect("encode");
        ws.send(Message::Text(frame.into())).await.expect("send");
        let (from, packet) = timeout(WAIT, packets.recv()).await.expect("timely").expect("packet");
        assert_eq!(from, primary_id);
        assert_eq!(packet.kind, "echo");

        // Secondary bootstrap
        let udp = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("udp");
        let request = Frame::SecondaryRequest {
            port: udp.local_addr().expect("udp addr").port(),
        };
        ws.send(Message::Text(request.to_text().expect("encode").into()))
            .await
            .expect("send request");

        let reply = timeout(WAIT, ws.next())
            .await
            .expect("timely")
            .expect("message")
            .expect("ok");
        let Frame::SecondaryReady { port } = Frame::parse(reply.to_text().expect("text")).expect("frame") else {
            panic!("expected secondaryReady");
        };

        let established = next_event(&mut events).await;
        assert_eq!(established.kind(), TransportKind::Secondary);
        let secondary_id = established.connection().id();
        assert_eq!(
            server.owner_of(secondary_id).map(|owner| owner.id()),
            Some(primary_id)
        );

        // Secondary packet
        udp.connect((Ipv4Addr::LOCALHOST, port)).await.expect("udp connect");
        let frame = Frame::Packet(Packet::empty("echo")).to_text().expect("encode");
        udp.send(frame.as_bytes()).await.expect("udp send");
        let (from, _) = timeout(WAIT, packets.recv()).await.expect("timely").expect("packet");
        assert_eq!(from, secondary_id);

        // Client disconnect cascades
        drop(ws);

        let first = next_event(&mut events).await;
        let second = next_event(&mut events).await;
        let (
            ServerEvent::Lost { kind: TransportKind::Secondary, reason: secondary_reason, .. },
            ServerEvent::Lost { kind: TransportKind::Primary, reason: primary_reason, .. },
        ) = (&first, &second)
        else {
            panic!("expected secondary then primary loss, got {first:?} then {second:?}");
        };
        assert_eq!(secondary_reason, primary_reason);
        assert_eq!(first.connection().id(), secondary_id);
        assert_eq!(second.connection().id(), primary_id);
        assert_eq!(server.connection_count(), 0);

        server.shutdown().await;
        assert!(!server.is_primary_listening());
    }
}
