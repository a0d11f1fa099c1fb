//! Primary transport acceptor.
//!
//! Accepting is split in two so a slow client cannot stall the accept loop:
//!
//! 1. [`StreamAcceptor::accept`] - Wait for a TCP connection
//! 2. [`upgrade`] - WebSocket handshake (with timeout), run per connection
//!
//! # Example
//!
//! ```ignore
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::time::Duration;
//! use connection_hub::transport::{StreamAcceptor, upgrade};
//!
//! let acceptor = StreamAcceptor::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
//! let (stream, peer) = acceptor.accept().await?;
//! let connection = upgrade(stream, peer, acceptor.local_addr().ip(), Duration::from_secs(10)).await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};

use super::stream::StreamConnection;

// ============================================================================
// StreamAcceptor
// ============================================================================

/// A bound TCP listener for primary connections.
#[derive(Debug)]
pub struct StreamAcceptor {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Bound address (with the OS-assigned port resolved).
    local_addr: SocketAddr,
}

impl StreamAcceptor {
    /// Binds to the given address and port.
    ///
    /// Use port 0 to let the OS assign a random available port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;

        debug!(%local_addr, "Primary acceptor bound");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Waits for the next TCP connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the accept fails.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(%peer, "TCP connection accepted");
        Ok((stream, peer))
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Upgrades an accepted TCP stream to a primary connection.
///
/// `local_ip` is where the connection's secondary sockets are bound.
///
/// # Errors
///
/// - [`Error::ConnectionTimeout`] if the handshake does not finish in time
/// - [`Error::Connection`] if the WebSocket upgrade fails
pub async fn upgrade(
    stream: TcpStream,
    peer: SocketAddr,
    local_ip: IpAddr,
    handshake_timeout: Duration,
) -> Result<Arc<StreamConnection>> {
    let ws_stream = timeout(handshake_timeout, tokio_tungstenite::accept_async(stream))
        .await
        .map_err(|_| Error::connection_timeout(handshake_timeout.as_millis() as u64))?
        .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

    debug!(%peer, "WebSocket handshake complete");

    Ok(StreamConnection::spawn(ws_stream, peer, local_ip))
}

// ============================================================================
// Tests
// ============================================================================
