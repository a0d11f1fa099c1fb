//! Primary transport: WebSocket over TCP.
//!
//! Each [`StreamConnection`] owns a tokio task running its event loop:
//!
//! - Incoming text frames are parsed as [`Frame`]s
//! - `packet` frames are dispatched to the registered packet handlers
//! - `secondaryRequest` frames bootstrap a [`DatagramConnection`]
//! - Outgoing packets and shutdown requests arrive over a command channel
//!
//! # Secondary Bootstrap
//!
//! ```text
//! client                          server (primary event loop)
//!   │  secondaryRequest{port} ──►   bind UDP on local ip:0
//!   │                               connect to peer ip:port
//!   │  ◄── secondaryReady{port}     report (primary, secondary) to on_secondary
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{CloseReason, Frame, Packet};

use super::connection::{Connection, ConnectionHandle};
use super::datagram::DatagramConnection;
use super::lifecycle::ConnectionCore;
use super::TransportKind;

// ============================================================================
// Types
// ============================================================================

/// Write half of the WebSocket.
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Internal commands for the event loop.
enum StreamCommand {
    /// Write an encoded frame.
    Send(String),
    /// Close the socket, optionally telling the peer why.
    Shutdown {
        reason: CloseReason,
        notify_remote: bool,
    },
}

// ============================================================================
// StreamConnection
// ============================================================================

/// A primary connection.
///
/// Created by the primary listener after the WebSocket upgrade; all I/O runs
/// on an internal task. `StreamConnection` is `Send + Sync` and is shared as a
/// [`ConnectionHandle`].
pub struct StreamConnection {
    /// Lifecycle state (shared with the event loop).
    core: Arc<ConnectionCore>,
    /// Channel to the event loop.
    command_tx: mpsc::UnboundedSender<StreamCommand>,
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.core.id())
            .field("peer", &self.core.peer_addr())
            .field("alive", &self.core.is_alive())
            .finish()
    }
}

impl StreamConnection {
    /// Wraps an upgraded WebSocket and spawns its event loop.
    ///
    /// `local_ip` is the address secondary sockets are bound on.
    pub(crate) fn spawn(
        ws_stream: WebSocketStream<TcpStream>,
        peer: SocketAddr,
        local_ip: IpAddr,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let core = Arc::new(ConnectionCore::new(TransportKind::Primary, Some(peer)));

        let connection = Arc::new(Self {
            core: Arc::clone(&core),
            command_tx,
        });

        tokio::spawn(Self::run_event_loop(
            Arc::downgrade(&connection),
            core,
            ws_stream,
            command_rx,
            local_ip,
        ));

        connection
    }

    /// Event loop that handles WebSocket I/O.
    async fn run_event_loop(
        this: Weak<Self>,
        core: Arc<ConnectionCore>,
        ws_stream: WebSocketStream<TcpStream>,
        mut command_rx: mpsc::UnboundedReceiver<StreamCommand>,
        local_ip: IpAddr,
    ) {
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let id = core.id();

        let reason = loop {
            tokio::select! {
                // Incoming frames from the client
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => match Frame::parse(&text)
                            .and_then(|frame| frame.inbound_on(TransportKind::Primary))
                        {
                            Ok(Frame::Packet(packet)) => core.dispatch(packet),

                            Ok(Frame::SecondaryRequest { port }) => {
                                Self::bootstrap_secondary(&this, &core, &mut ws_write, local_ip, port).await;
                            }

                            Ok(Frame::Close { reason }) => {
                                debug!(connection_id = %id, %reason, "Close frame received");
                                break reason;
                            }

                            // Refused by inbound_on
                            Ok(Frame::SecondaryReady { .. }) => {}

                            Err(e) => {
                                warn!(connection_id = %id, error = %e, "Rejected frame");
                            }
                        },

                        Some(Ok(Message::Close(_))) | None => {
                            debug!(connection_id = %id, "WebSocket closed by remote");
                            break CloseReason::ClientClosed;
                        }

                        Some(Err(e)) => {
                            debug!(connection_id = %id, error = %e, "WebSocket error");
                            break CloseReason::NetworkError;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                // Commands from the hub
                command = command_rx.recv() => {
                    match command {
                        Some(StreamCommand::Send(text)) => {
                            if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                                debug!(connection_id = %id, error = %e, "Write failed");
                                break CloseReason::NetworkError;
                            }
                        }

                        Some(StreamCommand::Shutdown { reason, notify_remote }) => {
                            if notify_remote {
                                Self::write_frame(&mut ws_write, &Frame::Close { reason }).await;
                            }
                            let _ = ws_write.close().await;
                            break reason;
                        }

                        None => {
                            debug!(connection_id = %id, "Command channel closed");
                            break CloseReason::ServerClosed;
                        }
                    }
                }
            }
        };

        // No-op when the close was local
        core.finish(reason);

        debug!(connection_id = %id, "Event loop terminated");
    }

    /// Binds a secondary socket for the client and reports it to the owner.
    async fn bootstrap_secondary(
        this: &Weak<Self>,
        core: &ConnectionCore,
        ws_write: &mut WsSink,
        local_ip: IpAddr,
        client_port: u16,
    ) {
        let id = core.id();
        let Some(peer_ip) = core.peer_addr().map(|addr| addr.ip()) else {
            return;
        };
        let client_addr = SocketAddr::new(peer_ip, client_port);

        let secondary = match DatagramConnection::bind(local_ip, client_addr).await {
            Ok(secondary) => secondary,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Failed to bind secondary socket");
                return;
            }
        };

        let ready = Frame::SecondaryReady {
            port: secondary.local_port(),
        };
        if !Self::write_frame(ws_write, &ready).await {
            secondary.close(CloseReason::NetworkError, false);
            return;
        }

        debug!(
            connection_id = %id,
            secondary_id = %secondary.id(),
            client = %client_addr,
            "Secondary bootstrapped"
        );

        match this.upgrade() {
            Some(primary) => core.secondary_established(primary, secondary),
            None => secondary.close(CloseReason::OwnerClosed, true),
        }
    }

    /// Encodes and writes one frame. Returns `false` on failure.
    async fn write_frame(ws_write: &mut WsSink, frame: &Frame) -> bool {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                return false;
            }
        };

        match ws_write.send(Message::Text(text.into())).await {
            Ok(()) => true,
            Err(e) => {
                trace!(error = %e, "Frame write failed");
                false
            }
        }
    }
}

impl Connection for StreamConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn send(&self, packet: &Packet) -> Result<()> {
        if !self.core.is_alive() {
            return Err(Error::ConnectionClosed);
        }

        let text = Frame::Packet(packet.clone()).to_text()?;
        self.command_tx
            .send(StreamCommand::Send(text))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn close(&self, reason: CloseReason, notify_remote: bool) {
        if self.core.finish(reason) {
            let _ = self.command_tx.send(StreamCommand::Shutdown {
                reason,
                notify_remote,
            });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
