//! Per-transport accept loop.
//!
//! A [`ListenerLoop`] owns at most one running accept task. `start` and `stop`
//! are serialized by an async mutex, and `stop` waits for the task to finish,
//! so the listening socket is released before `stop` returns.
//!
//! # State Machine
//!
//! ```text
//! Stopped ──start──► Starting ──bound──► Listening ──stop──► Stopping ──► Stopped
//!    ▲                  │                    │
//!    └──── bind error ──┘                    └── acceptor closed ──► Stopped
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::transport::{ConnectionHandle, StreamAcceptor, TertiaryListener, TransportKind};

// ============================================================================
// Constants
// ============================================================================

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Types
// ============================================================================

/// Lifecycle state of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    /// No accept loop.
    Stopped,
    /// Binding the listening resource.
    Starting,
    /// Accept loop running.
    Listening,
    /// Stop requested, waiting for the loop to exit.
    Stopping,
}

impl ListenerState {
    /// Returns the display name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of accepted items for a [`ListenerLoop`].
#[async_trait]
pub trait Acceptor: Send + 'static {
    /// What one successful accept yields.
    type Item: Send + 'static;

    /// Waits for the next item.
    ///
    /// `Ok(None)` means the acceptor is exhausted and the loop should end.
    ///
    /// # Errors
    ///
    /// A failed accept; the loop logs it and keeps going.
    async fn accept(&mut self) -> Result<Option<Self::Item>>;
}

#[async_trait]
impl Acceptor for StreamAcceptor {
    type Item = (TcpStream, SocketAddr);

    async fn accept(&mut self) -> Result<Option<Self::Item>> {
        StreamAcceptor::accept(self).await.map(Some)
    }
}

#[async_trait]
impl Acceptor for Box<dyn TertiaryListener> {
    type Item = ConnectionHandle;

    async fn accept(&mut self) -> Result<Option<Self::Item>> {
        Ok(TertiaryListener::accept(&mut **self).await?)
    }
}

/// A spawned accept loop.
struct RunningLoop {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

// ============================================================================
// ListenerLoop
// ============================================================================

/// Accept loop controller for one transport.
pub struct ListenerLoop {
    /// Transport this loop accepts for (log field).
    kind: TransportKind,
    /// The running loop, if any. Held across `start`/`stop`.
    running: AsyncMutex<Option<RunningLoop>>,
    /// Current state, shared with the loop task.
    state: Arc<Mutex<ListenerState>>,
    /// Number of loop tasks alive.
    active_loops: Arc<AtomicUsize>,
}

impl fmt::Debug for ListenerLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerLoop")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ListenerLoop {
    /// Creates a stopped listener for `kind`.
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            running: AsyncMutex::new(None),
            state: Arc::new(Mutex::new(ListenerState::Stopped)),
            active_loops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    /// Returns `true` while the accept loop runs.
    #[inline]
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state() == ListenerState::Listening
    }

    /// Number of accept loop tasks currently alive.
    #[inline]
    #[must_use]
    pub fn active_loops(&self) -> usize {
        self.active_loops.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.lock() = state;
    }

    /// Binds with `bind` and spawns the accept loop.
    ///
    /// Every accepted item is passed to `handler` on the loop task; the handler
    /// must not block. Returns `false` (and drops `bind` unpolled) when a loop
    /// is already running.
    ///
    /// # Errors
    ///
    /// Returns the bind error; the listener stays stopped.
    pub async fn start<A, B, H>(&self, bind: B, handler: H) -> Result<bool>
    where
        A: Acceptor,
        B: Future<Output = Result<A>> + Send,
        H: Fn(A::Item) + Send + Sync + 'static,
    {
        let mut running = self.running.lock().await;

        if let Some(current) = running.as_ref()
            && !current.task.is_finished()
        {
            debug!(kind = %self.kind, "Listener already running");
            return Ok(false);
        }
        *running = None;

        self.set_state(ListenerState::Starting);
        let acceptor = match bind.await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                self.set_state(ListenerState::Stopped);
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        self.set_state(ListenerState::Listening);
        self.active_loops.fetch_add(1, Ordering::SeqCst);

        let task = tokio::spawn(run_accept_loop(
            self.kind,
            acceptor,
            handler,
            stop_rx,
            Arc::clone(&self.state),
            Arc::clone(&self.active_loops),
        ));
        *running = Some(RunningLoop { stop_tx, task });

        info!(kind = %self.kind, "Listener started");
        Ok(true)
    }

    /// Stops the accept loop and waits for it to exit.
    ///
    /// Returns `false` if nothing was running.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return false;
        };
        if current.task.is_finished() {
            self.set_state(ListenerState::Stopped);
            return false;
        }

        self.set_state(ListenerState::Stopping);
        let _ = current.stop_tx.send(());

        if let Err(e) = current.task.await
            && e.is_panic()
        {
            error!(kind = %self.kind, "Accept loop panicked");
        }

        self.set_state(ListenerState::Stopped);
        info!(kind = %self.kind, "Listener stopped");
        true
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

/// Background task that accepts until stopped or the acceptor is exhausted.
async fn run_accept_loop<A, H>(
    kind: TransportKind,
    mut acceptor: A,
    handler: H,
    mut stop_rx: oneshot::Receiver<()>,
    state: Arc<Mutex<ListenerState>>,
    active_loops: Arc<AtomicUsize>,
) where
    A: Acceptor,
    H: Fn(A::Item) + Send + Sync + 'static,
{
    debug!(%kind, "Accept loop started");

    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => break,

            accepted = acceptor.accept() => match accepted {
                Ok(Some(item)) => handler(item),

                Ok(None) => {
                    debug!(%kind, "Acceptor closed");
                    mark_exhausted(&state);
                    break;
                }

                Err(e) => {
                    warn!(%kind, error = %e, "Accept failed");
                    tokio::select! {
                        biased;
                        _ = &mut stop_rx => break,
                        () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            },
        }
    }

    // Releases the listening resource
    drop(acceptor);
    active_loops.fetch_sub(1, Ordering::SeqCst);

    debug!(%kind, "Accept loop terminated");
}

/// Moves a listening loop to `Stopped` when its acceptor ran dry.
fn mark_exhausted(state: &Mutex<ListenerState>) {
    let mut state = state.lock();
    if *state == ListenerState::Listening {
        *state = ListenerState::Stopped;
    }
}

// ============================================================================
// Tests
// ============================================================================
