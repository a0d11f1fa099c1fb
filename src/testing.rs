//! Test doubles shared by unit tests.

// ============================================================================
// Imports
// ============================================================================

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::{CloseReason, Packet};
use crate::server::EventHub;
use crate::transport::{
    Connection, ConnectionCore, ConnectionHandle, TertiaryListener, TertiaryTransport,
    TransportKind,
};

// ============================================================================
// MockConnection
// ============================================================================

/// In-memory connection recording what the hub does to it.
#[derive(Debug)]
pub(crate) struct MockConnection {
    core: ConnectionCore,
    sent: Mutex<Vec<Packet>>,
    close_calls: AtomicUsize,
    failing: AtomicBool,
}

impl MockConnection {
    pub(crate) fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            core: ConnectionCore::new(kind, None),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub(crate) fn primary() -> Arc<Self> {
        Self::new(TransportKind::Primary)
    }

    pub(crate) fn secondary() -> Arc<Self> {
        Self::new(TransportKind::Secondary)
    }

    pub(crate) fn tertiary() -> Arc<Self> {
        Self::new(TransportKind::Tertiary)
    }

    /// Reports `secondary` as bootstrapped by this primary.
    pub(crate) fn bootstrap(self: &Arc<Self>, secondary: &Arc<MockConnection>) {
        self.core.secondary_established(
            Arc::clone(self) as ConnectionHandle,
            Arc::clone(secondary) as ConnectionHandle,
        );
    }

    /// Simulates the peer going away.
    pub(crate) fn remote_close(&self, reason: CloseReason) {
        self.core.finish(reason);
    }

    pub(crate) fn closed_with(&self) -> Option<CloseReason> {
        self.core.close_reason()
    }

    pub(crate) fn sent(&self) -> Vec<Packet> {
        self.sent.lock().clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Makes every later `send` fail while the connection stays open.
    pub(crate) fn fail_sends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl Connection for MockConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn send(&self, packet: &Packet) -> Result<()> {
        if !self.core.is_alive() {
            return Err(Error::ConnectionClosed);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::connection("send failed"));
        }
        self.sent.lock().push(packet.clone());
        Ok(())
    }

    fn close(&self, reason: CloseReason, _notify_remote: bool) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.core.finish(reason);
    }
}

// ============================================================================
// MockTertiaryTransport
// ============================================================================

/// Tertiary transport fed by [`push`](Self::push).
#[derive(Debug)]
pub(crate) struct MockTertiaryTransport {
    supported: bool,
    current: Mutex<Option<mpsc::UnboundedSender<ConnectionHandle>>>,
    binds: AtomicUsize,
    last_backlog: Mutex<Option<u32>>,
}

impl MockTertiaryTransport {
    pub(crate) fn new(supported: bool) -> Arc<Self> {
        Arc::new(Self {
            supported,
            current: Mutex::new(None),
            binds: AtomicUsize::new(0),
            last_backlog: Mutex::new(None),
        })
    }

    /// Hands a connection to the currently open listener.
    pub(crate) fn push(&self, connection: ConnectionHandle) -> bool {
        match self.current.lock().as_ref() {
            Some(tx) => tx.send(connection).is_ok(),
            None => false,
        }
    }

    pub(crate) fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub(crate) fn last_backlog(&self) -> Option<u32> {
        *self.last_backlog.lock()
    }
}

#[async_trait]
impl TertiaryTransport for MockTertiaryTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn bind(&self, backlog: u32) -> io::Result<Box<dyn TertiaryListener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.current.lock() = Some(tx);
        *self.last_backlog.lock() = Some(backlog);
        self.binds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTertiaryListener { rx }))
    }
}

struct MockTertiaryListener {
    rx: mpsc::UnboundedReceiver<ConnectionHandle>,
}

#[async_trait]
impl TertiaryListener for MockTertiaryListener {
    async fn accept(&mut self) -> io::Result<Option<ConnectionHandle>> {
        Ok(self.rx.recv().await)
    }
}

// ============================================================================
// EventLog
// ============================================================================

/// One recorded hub event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recorded {
    Established(ConnectionId, TransportKind),
    Lost(ConnectionId, TransportKind, CloseReason),
}

/// Synchronous recorder of every event the hub emits, in emission order.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventLog {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl EventLog {
    pub(crate) fn attach(hub: &EventHub) -> Self {
        let log = Self::default();

        let events = Arc::clone(&log.events);
        hub.subscribe_established(move |connection, kind| {
            events.lock().push(Recorded::Established(connection.id(), kind));
        });

        let events = Arc::clone(&log.events);
        hub.subscribe_lost(move |connection, kind, reason| {
            events.lock().push(Recorded::Lost(connection.id(), kind, reason));
        });

        log
    }

    pub(crate) fn all(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    pub(crate) fn lost(&self) -> Vec<(ConnectionId, TransportKind, CloseReason)> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Lost(id, kind, reason) => Some((id, kind, reason)),
                Recorded::Established(..) => None,
            })
            .collect()
    }

    pub(crate) fn lost_count(&self, id: ConnectionId) -> usize {
        self.lost().iter().filter(|(lost, _, _)| *lost == id).count()
    }

    pub(crate) fn established_count(&self, id: ConnectionId) -> usize {
        self.all()
            .iter()
            .filter(|event| matches!(event, Recorded::Established(established, _) if *established == id))
            .count()
    }

    /// Position of the first event about `id`.
    pub(crate) fn position(&self, id: ConnectionId, lost: bool) -> Option<usize> {
        self.all().iter().position(|event| match event {
            Recorded::Established(event_id, _) => !lost && *event_id == id,
            Recorded::Lost(event_id, _, _) => lost && *event_id == id,
        })
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Routes crate logs to the test output, filtered by `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
