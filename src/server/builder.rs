//! Builder pattern for server configuration.
//!
//! Provides a fluent API for configuring and creating [`ConnectionServer`]
//! instances.
//!
//! # Example
//!
//! ```no_run
//! use connection_hub::ConnectionServer;
//!
//! # async fn example() -> connection_hub::Result<()> {
//! let server = ConnectionServer::builder()
//!     .port(7777)
//!     .secondary_limit(2)
//!     .spawn()
//!     .await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::transport::TertiaryTransport;

use super::core::ConnectionServer;
use super::options::ServerOptions;

// ============================================================================
// ServerBuilder
// ============================================================================

/// Builder for configuring a [`ConnectionServer`] instance.
///
/// Use [`ConnectionServer::builder()`] to create a new builder.
#[derive(Default, Clone)]
pub struct ServerBuilder {
    /// Accumulated options.
    options: ServerOptions,
    /// Transport for the tertiary pool.
    tertiary_transport: Option<Arc<dyn TertiaryTransport>>,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("options", &self.options)
            .field(
                "tertiary_transport",
                &self.tertiary_transport.as_ref().map(|transport| transport.name()),
            )
            .finish()
    }
}

// ============================================================================
// ServerBuilder Implementation
// ============================================================================

impl ServerBuilder {
    /// Creates a new builder with default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all options at once.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the primary listener bind address.
    #[inline]
    #[must_use]
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.options.bind_ip = ip;
        self
    }

    /// Sets the primary listener port. `0` lets the OS choose.
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    /// Enables or disables secondaries.
    #[inline]
    #[must_use]
    pub fn allow_secondary(mut self, allow: bool) -> Self {
        self.options.allow_secondary = allow;
        self
    }

    /// Sets the maximum number of secondaries per primary.
    #[inline]
    #[must_use]
    pub fn secondary_limit(mut self, limit: usize) -> Self {
        self.options.secondary_limit = limit;
        self
    }

    /// Enables or disables tertiaries.
    #[inline]
    #[must_use]
    pub fn allow_tertiary(mut self, allow: bool) -> Self {
        self.options.allow_tertiary = allow;
        self
    }

    /// Sets the tertiary pending-connection queue depth.
    #[inline]
    #[must_use]
    pub fn tertiary_backlog(mut self, backlog: u32) -> Self {
        self.options.tertiary_backlog = backlog;
        self
    }

    /// Sets the WebSocket handshake timeout.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_handshake_timeout(timeout);
        self
    }

    /// Installs the transport backing the tertiary pool.
    ///
    /// Without one, the tertiary listener never starts; tertiaries can still
    /// be added through [`ConnectionServer::attach_tertiary`].
    #[inline]
    #[must_use]
    pub fn tertiary_transport(mut self, transport: Arc<dyn TertiaryTransport>) -> Self {
        self.tertiary_transport = Some(transport);
        self
    }

    /// Builds a stopped server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the options are invalid.
    pub fn build(self) -> Result<ConnectionServer> {
        ConnectionServer::with_transport(self.options, self.tertiary_transport)
    }

    /// Builds the server and starts its listeners.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`](crate::Error::Config) if the options are invalid
    /// - [`Error::Io`](crate::Error::Io) if the primary listener cannot bind
    pub async fn spawn(self) -> Result<ConnectionServer> {
        let server = self.build()?;
        server.start().await?;
        Ok(server)
    }
}

// ============================================================================
// Tests
// ============================================================================
