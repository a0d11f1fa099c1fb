//! Secondary transport: connected UDP socket.
//!
//! One JSON [`Frame`] per datagram. A secondary is always created by its
//! owning primary during the bootstrap handshake; it has no listener of its
//! own.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{CloseReason, Frame, Packet};

use super::TransportKind;
use super::connection::Connection;
use super::lifecycle::ConnectionCore;

// ============================================================================
// Constants
// ============================================================================

/// Receive buffer size (maximum UDP payload).
const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Types
// ============================================================================

/// Internal commands for the receive loop.
enum DatagramCommand {
    /// Write an encoded frame.
    Send(Vec<u8>),
    /// Stop, optionally telling the peer why.
    Shutdown {
        reason: CloseReason,
        notify_remote: bool,
    },
}

// ============================================================================
// DatagramConnection
// ============================================================================

/// A secondary connection over UDP.
pub struct DatagramConnection {
    /// Lifecycle state (shared with the receive loop).
    core: Arc<ConnectionCore>,
    /// Local port the socket is bound to.
    local_port: u16,
    /// Channel to the receive loop.
    command_tx: mpsc::UnboundedSender<DatagramCommand>,
}

impl fmt::Debug for DatagramConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramConnection")
            .field("id", &self.core.id())
            .field("peer", &self.core.peer_addr())
            .field("local_port", &self.local_port)
            .field("alive", &self.core.is_alive())
            .finish()
    }
}

impl DatagramConnection {
    /// Binds an ephemeral UDP port on `local_ip` and connects it to `peer`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if binding or connecting fails.
    pub(crate) async fn bind(local_ip: IpAddr, peer: SocketAddr) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
        socket.connect(peer).await?;
        let local_port = socket.local_addr()?.port();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let core = Arc::new(ConnectionCore::new(TransportKind::Secondary, Some(peer)));

        tokio::spawn(Self::run_receive_loop(Arc::clone(&core), socket, command_rx));

        Ok(Arc::new(Self {
            core,
            local_port,
            command_tx,
        }))
    }

    /// Returns the local UDP port.
    #[inline]
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Receive loop: datagrams in, commands out.
    async fn run_receive_loop(
        core: Arc<ConnectionCore>,
        socket: UdpSocket,
        mut command_rx: mpsc::UnboundedReceiver<DatagramCommand>,
    ) {
        let id = core.id();
        let mut buffer = vec![0u8; DATAGRAM_BUFFER_SIZE];

        let reason = loop {
            tokio::select! {
                received = socket.recv(&mut buffer) => {
                    match received {
                        Ok(len) => match Frame::parse_bytes(&buffer[..len])
                            .and_then(|frame| frame.inbound_on(TransportKind::Secondary))
                        {
                            Ok(Frame::Packet(packet)) => core.dispatch(packet),
                            Ok(Frame::Close { reason }) => {
                                debug!(connection_id = %id, %reason, "Close datagram received");
                                break reason;
                            }
                            // Refused by inbound_on
                            Ok(Frame::SecondaryRequest { .. } | Frame::SecondaryReady { .. }) => {}
                            Err(e) => {
                                warn!(connection_id = %id, error = %e, "Rejected datagram");
                            }
                        },

                        // ICMP port unreachable from an earlier send; the peer may come back
                        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                            trace!(connection_id = %id, "Peer port unreachable");
                        }

                        Err(e) => {
                            debug!(connection_id = %id, error = %e, "Datagram receive failed");
                            break CloseReason::NetworkError;
                        }
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(DatagramCommand::Send(bytes)) => {
                            if let Err(e) = socket.send(&bytes).await {
                                trace!(connection_id = %id, error = %e, "Datagram send failed");
                            }
                        }

                        Some(DatagramCommand::Shutdown { reason, notify_remote }) => {
                            if notify_remote
                                && let Ok(text) = (Frame::Close { reason }).to_text()
                            {
                                let _ = socket.send(text.as_bytes()).await;
                            }
                            break reason;
                        }

                        None => break CloseReason::ServerClosed,
                    }
                }
            }
        };

        core.finish(reason);

        debug!(connection_id = %id, "Receive loop terminated");
    }
}

impl Connection for DatagramConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn send(&self, packet: &Packet) -> Result<()> {
        if !self.core.is_alive() {
            return Err(Error::ConnectionClosed);
        }

        let text = Frame::Packet(packet.clone()).to_text()?;
        self.command_tx
            .send(DatagramCommand::Send(text.into_bytes()))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn close(&self, reason: CloseReason, notify_remote: bool) {
        if self.core.finish(reason) {
            let _ = self.command_tx.send(DatagramCommand::Shutdown {
                reason,
                notify_remote,
            });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;
    use std::time::Duration;

    use tokio::time::timeout;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn pair() -> (Arc<DatagramConnection>, UdpSocket) {
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind");
        let connection = DatagramConnection::bind(LOCALHOST, client.local_addr().expect("addr"))
            .await
            .expect("secondary");
        client
            .connect((Ipv4Addr::LOCALHOST, connection.local_port()))
            .await
            .expect("connect");
        (connection, client)
    }

    #[tokio::test]
    async fn test_send_writes_one_datagram() {
        let (connection, client) = pair().await;

        connection
            .send(&Packet::empty("tick"))
            .expect("send should succeed");

        let mut buffer = [0u8; 1024];
        let len = timeout(Duration::from_secs(5), client.recv(&mut buffer))
            .await
            .expect("timely")
            .expect("recv");
        let frame = Frame::parse_bytes(&buffer[..len]).expect("frame");
        assert_eq!(frame, Frame::Packet(Packet::empty("tick")));
    }

    #[tokio::test]
    async fn test_inbound_packet_is_dispatched() {
        let (connection, client) = pair().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = parking_lot::Mutex::new(Some(tx));
        connection.add_packet_handler(
            "position",
            Arc::new(move |_, packet: Packet| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(packet);
                }
            }),
        );

        let frame = Frame::Packet(Packet::new("position", serde_json::json!([1, 2])));
        client
            .send(frame.to_text().expect("encode").as_bytes())
            .await
            .expect("send");

        let packet = timeout(Duration::from_secs(5), rx)
            .await
            .expect("timely")
            .expect("packet");
        assert_eq!(packet.kind, "position");
    }

    #[tokio::test]
    async fn test_control_frame_is_refused_without_closing() {
        let (connection, client) = pair().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = parking_lot::Mutex::new(Some(tx));
        connection.add_packet_handler(
            "after",
            Arc::new(move |_, packet: Packet| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(packet);
                }
            }),
        );

        for frame in [
            Frame::SecondaryRequest { port: 1 },
            Frame::Packet(Packet::empty("after")),
        ] {
            client
                .send(frame.to_text().expect("encode").as_bytes())
                .await
                .expect("send");
        }

        let packet = timeout(Duration::from_secs(5), rx)
            .await
            .expect("timely")
            .expect("packet");
        assert_eq!(packet.kind, "after");
        assert!(connection.is_alive());
    }

    #[tokio::test]
    async fn test_remote_close_datagram_closes() {
        let (connection, client) = pair().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        connection.on_closed(Box::new(move |reason| {
            let _ = tx.send(reason);
        }));

        let frame = Frame::Close {
            reason: CloseReason::ClientClosed,
        };
        client
            .send(frame.to_text().expect("encode").as_bytes())
            .await
            .expect("send");

        let reason = timeout(Duration::from_secs(5), rx)
            .await
            .expect("timely")
            .expect("reason");
        assert_eq!(reason, CloseReason::ClientClosed);
        assert!(!connection.is_alive());
    }

    #[tokio::test]
    async fn test_local_close_is_synchronous() {
        let (connection, _client) = pair().await;

        connection.close(CloseReason::OwnerClosed, false);

        assert!(!connection.is_alive());
        assert_eq!(connection.core().close_reason(), Some(CloseReason::OwnerClosed));
        assert!(connection.send(&Packet::empty("late")).is_err());
    }
}
