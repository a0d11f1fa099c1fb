//! Server configuration.
//!
//! [`ServerOptions`] is plain data used to build a server. Once the server
//! runs, the admission switches live in [`Settings`] and can be changed at any
//! time; they are read at the moment of each admission decision.
//!
//! # Example
//!
//! ```ignore
//! use connection_hub::ServerOptions;
//!
//! let options = ServerOptions::new()
//!     .with_port(7777)
//!     .with_secondary_limit(2)
//!     .with_tertiary(true);
//!
//! options.validate()?;
//! ```
//!
//! # JSON
//!
//! ```json
//! { "port": 7777, "secondaryLimit": 2, "allowTertiary": true }
//! ```
//!
//! Missing fields take their defaults.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default number of secondaries a primary may own.
pub const DEFAULT_SECONDARY_LIMIT: usize = 1;

/// Default tertiary pending-connection queue depth.
pub const DEFAULT_TERTIARY_BACKLOG: u32 = 15;

/// Default WebSocket handshake timeout in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

// ============================================================================
// ServerOptions
// ============================================================================

/// Configuration for a [`ConnectionServer`](crate::ConnectionServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerOptions {
    /// Address the primary listener binds to.
    pub bind_ip: IpAddr,

    /// Primary listener port (0 lets the OS choose).
    pub port: u16,

    /// Accept secondary connections.
    pub allow_secondary: bool,

    /// Maximum secondaries per primary.
    pub secondary_limit: usize,

    /// Accept tertiary connections.
    pub allow_tertiary: bool,

    /// Tertiary pending-connection queue depth.
    pub tertiary_backlog: u32,

    /// WebSocket handshake timeout in milliseconds.
    pub handshake_timeout_ms: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ServerOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            allow_secondary: true,
            secondary_limit: DEFAULT_SECONDARY_LIMIT,
            allow_tertiary: false,
            tertiary_backlog: DEFAULT_TERTIARY_BACKLOG,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }

    /// Parses options from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the text is not valid options JSON
    /// - [`Error::Config`] if the parsed options fail [`validate`](Self::validate)
    pub fn from_json(text: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ServerOptions {
    /// Sets the bind address.
    #[inline]
    #[must_use]
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Sets the primary port.
    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enables or disables secondaries.
    #[inline]
    #[must_use]
    pub fn with_secondary(mut self, allow: bool) -> Self {
        self.allow_secondary = allow;
        self
    }

    /// Sets the per-primary secondary limit.
    #[inline]
    #[must_use]
    pub fn with_secondary_limit(mut self, limit: usize) -> Self {
        self.secondary_limit = limit;
        self
    }

    /// Enables or disables tertiaries.
    #[inline]
    #[must_use]
    pub fn with_tertiary(mut self, allow: bool) -> Self {
        self.allow_tertiary = allow;
        self
    }

    /// Sets the tertiary pending-connection queue depth.
    #[inline]
    #[must_use]
    pub fn with_tertiary_backlog(mut self, backlog: u32) -> Self {
        self.tertiary_backlog = backlog;
        self
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

// ============================================================================
// Accessors & Validation
// ============================================================================

impl ServerOptions {
    /// Returns the handshake timeout.
    #[inline]
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the tertiary backlog or the handshake
    /// timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.tertiary_backlog == 0 {
            return Err(Error::config("Tertiary backlog must be greater than zero"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(Error::config("Handshake timeout must be greater than zero"));
        }
        Ok(())
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Runtime admission settings.
///
/// Lock-free; every read sees the latest write.
#[derive(Debug)]
pub struct Settings {
    allow_secondary: AtomicBool,
    secondary_limit: AtomicUsize,
    allow_tertiary: AtomicBool,
    tertiary_backlog: AtomicU32,
}

impl Settings {
    /// Seeds the settings from options.
    #[must_use]
    pub fn from_options(options: &ServerOptions) -> Self {
        Self {
            allow_secondary: AtomicBool::new(options.allow_secondary),
            secondary_limit: AtomicUsize::new(options.secondary_limit),
            allow_tertiary: AtomicBool::new(options.allow_tertiary),
            tertiary_backlog: AtomicU32::new(options.tertiary_backlog),
        }
    }

    /// Whether secondaries are accepted.
    #[inline]
    #[must_use]
    pub fn allow_secondary(&self) -> bool {
        self.allow_secondary.load(Ordering::Acquire)
    }

    /// Enables or disables secondaries.
    #[inline]
    pub fn set_allow_secondary(&self, allow: bool) {
        self.allow_secondary.store(allow, Ordering::Release);
    }

    /// Maximum secondaries per primary.
    #[inline]
    #[must_use]
    pub fn secondary_limit(&self) -> usize {
        self.secondary_limit.load(Ordering::Acquire)
    }

    /// Sets the per-primary secondary limit.
    ///
    /// Applies to future admissions only; already admitted secondaries stay.
    #[inline]
    pub fn set_secondary_limit(&self, limit: usize) {
        self.secondary_limit.store(limit, Ordering::Release);
    }

    /// Whether tertiaries are accepted.
    #[inline]
    #[must_use]
    pub fn allow_tertiary(&self) -> bool {
        self.allow_tertiary.load(Ordering::Acquire)
    }

    /// Enables or disables tertiaries.
    #[inline]
    pub fn set_allow_tertiary(&self, allow: bool) {
        self.allow_tertiary.store(allow, Ordering::Release);
    }

    /// Tertiary pending-connection queue depth.
    #[inline]
    #[must_use]
    pub fn tertiary_backlog(&self) -> u32 {
        self.tertiary_backlog.load(Ordering::Acquire)
    }

    /// Sets the tertiary backlog used by the next listener start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `backlog` is zero.
    pub fn set_tertiary_backlog(&self, backlog: u32) -> Result<()> {
        if backlog == 0 {
            return Err(Error::config("Tertiary backlog must be greater than zero"));
        }
        self.tertiary_backlog.store(backlog, Ordering::Release);
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_options(&ServerOptions::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
