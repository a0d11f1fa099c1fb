//! Connection server.
//!
//! This module ties the transports together: it accepts connections, decides
//! whether they may stay, keeps track of who owns whom, and tears families down
//! when a primary goes away.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ConnectionServer`] | Orchestrator and public API |
//! | [`ServerBuilder`] | Fluent configuration builder |
//! | [`ServerOptions`] | Startup options; [`Settings`] for runtime switches |
//! | [`ConnectionRegistry`] | Primaries, owned secondaries and the tertiary pool |
//! | [`EventHub`] | `Established` / `Lost` multicast |
//! | [`ListenerLoop`] | Restartable accept loop |
//! | [`decide`] | Admission policy |
//!
//! # Example
//!
//! ```no_run
//! use connection_hub::{Connection, ConnectionServer, Result};
//!
//! # async fn example() -> Result<()> {
//! let server = ConnectionServer::builder().port(7777).spawn().await?;
//!
//! server.on_established(|connection, kind| {
//!     tracing::info!(id = %connection.id(), %kind, "joined");
//! });
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Admission policy.
pub mod admission;

/// Fluent builder pattern for server configuration.
pub mod builder;

/// Core server implementation.
pub mod core;

/// Connection event hub.
pub mod events;

/// Restartable accept loop.
pub mod listener;

/// Server options and runtime settings.
pub mod options;

/// Connection registry.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use admission::{Decision, RejectReason, decide};
pub use builder::ServerBuilder;
pub use self::core::{BroadcastReport, ConnectionServer};
pub use events::{EstablishedHandler, EventHub, LostHandler, ServerEvent};
pub use listener::{Acceptor, ListenerLoop, ListenerState};
pub use options::{ServerOptions, Settings};
pub use registry::{Admission, ConnectionRegistry, Removal};
