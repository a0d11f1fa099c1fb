//! Connection registry.
//!
//! Tracks live primaries with the secondaries they own, plus a flat pool of
//! tertiaries. All state sits behind one `RwLock`; every mutation is a single
//! critical section, so callers never observe a half-removed family.
//!
//! # Layout
//!
//! ```text
//! primaries:  conn-1 ─► { connection, secondaries: {conn-4, conn-7}, lane }
//!             conn-2 ─► { connection, secondaries: {}, lane }
//! owners:     conn-4 ─► conn-1
//!             conn-7 ─► conn-1
//! tertiaries: conn-9
//! ```
//!
//! # Event lanes
//!
//! Each primary entry carries a reentrant lane lock. The server holds it
//! while it mutates the family and emits the matching events, which keeps
//! `Lost(primary)` behind every event about its secondaries. The registry only
//! hands lanes out; it never takes them itself.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::{ReentrantMutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::transport::{Connection, ConnectionHandle, TransportKind};

use super::admission::{self, Decision, RejectReason};

// ============================================================================
// Types
// ============================================================================

/// Serializes event emission for one primary and its secondaries.
pub(crate) type EventLane = Arc<ReentrantMutex<()>>;

/// Result of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The connection was added.
    Admitted,
    /// The connection was refused; registry state is unchanged.
    Rejected(RejectReason),
    /// The owning primary is no longer registered.
    OwnerNotFound,
}

/// What [`ConnectionRegistry::unregister`] removed.
#[derive(Debug)]
pub enum Removal {
    /// A primary together with the secondaries it owned.
    Primary {
        /// Secondaries removed with their owner.
        orphans: Vec<ConnectionHandle>,
    },
    /// A secondary, detached from its owner.
    Secondary {
        /// The owning primary.
        owner: ConnectionId,
    },
    /// A tertiary.
    Tertiary,
    /// Nothing was registered under the ID.
    NotRegistered,
}

/// A registered primary and its family.
struct PrimaryEntry {
    connection: ConnectionHandle,
    secondaries: FxHashMap<ConnectionId, ConnectionHandle>,
    lane: EventLane,
}

#[derive(Default)]
struct RegistryState {
    primaries: FxHashMap<ConnectionId, PrimaryEntry>,
    /// Reverse index: secondary → owning primary.
    owners: FxHashMap<ConnectionId, ConnectionId>,
    tertiaries: FxHashMap<ConnectionId, ConnectionHandle>,
}

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Registry of live connections.
///
/// An owned value; each server has its own.
#[derive(Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ConnectionRegistry")
            .field("primaries", &state.primaries.len())
            .field("secondaries", &state.owners.len())
            .field("tertiaries", &state.tertiaries.len())
            .finish()
    }
}

// ============================================================================
// ConnectionRegistry - Registration
// ============================================================================

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a primary with an empty secondary set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateConnection`] if the primary is already registered.
    pub fn register_primary(&self, connection: ConnectionHandle) -> Result<()> {
        let id = connection.id();
        let mut state = self.state.write();

        if state.primaries.contains_key(&id) {
            return Err(Error::duplicate_connection(id));
        }

        state.primaries.insert(
            id,
            PrimaryEntry {
                connection,
                secondaries: FxHashMap::default(),
                lane: Arc::new(ReentrantMutex::new(())),
            },
        );

        trace!(connection_id = %id, "Primary registered");
        Ok(())
    }

    /// Registers `secondary` under `primary_id` if admission allows it.
    ///
    /// Owner lookup, admission and insertion happen in one write-locked step.
    /// A rejected secondary leaves the registry untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateConnection`] if the secondary already has an owner.
    pub fn register_secondary(
        &self,
        primary_id: ConnectionId,
        secondary: ConnectionHandle,
        allowed: bool,
        limit: usize,
    ) -> Result<Admission> {
        let secondary_id = secondary.id();
        let mut guard = self.state.write();
        let state = &mut *guard;

        if state.owners.contains_key(&secondary_id) {
            return Err(Error::duplicate_connection(secondary_id));
        }

        let Some(entry) = state.primaries.get_mut(&primary_id) else {
            return Ok(Admission::OwnerNotFound);
        };

        match admission::decide(entry.secondaries.len(), limit, allowed) {
            Decision::Reject(reason) => Ok(Admission::Rejected(reason)),
            Decision::Admit => {
                entry.secondaries.insert(secondary_id, secondary);
                state.owners.insert(secondary_id, primary_id);

                trace!(connection_id = %secondary_id, owner = %primary_id, "Secondary registered");
                Ok(Admission::Admitted)
            }
        }
    }

    /// Adds a tertiary to the flat pool if the transport is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateConnection`] if the tertiary is already pooled.
    pub fn register_tertiary(
        &self,
        connection: ConnectionHandle,
        allowed: bool,
    ) -> Result<Admission> {
        if !allowed {
            return Ok(Admission::Rejected(RejectReason::NotPermitted));
        }

        let id = connection.id();
        let mut state = self.state.write();

        if state.tertiaries.contains_key(&id) {
            return Err(Error::duplicate_connection(id));
        }
        state.tertiaries.insert(id, connection);

        trace!(connection_id = %id, "Tertiary registered");
        Ok(Admission::Admitted)
    }

    /// Removes a connection of any kind.
    ///
    /// Removing a primary removes its whole secondary set in the same critical
    /// section and returns it as orphans; from then on `owner_of` reports
    /// `None` for every orphan.
    pub fn unregister(&self, id: ConnectionId) -> Removal {
        let mut state = self.state.write();

        if let Some(entry) = state.primaries.remove(&id) {
            for secondary_id in entry.secondaries.keys() {
                state.owners.remove(secondary_id);
            }
            let orphans: Vec<_> = entry.secondaries.into_values().collect();

            trace!(connection_id = %id, orphans = orphans.len(), "Primary unregistered");
            return Removal::Primary { orphans };
        }

        if let Some(owner) = state.owners.remove(&id) {
            if let Some(entry) = state.primaries.get_mut(&owner) {
                entry.secondaries.remove(&id);
            }

            trace!(connection_id = %id, %owner, "Secondary unregistered");
            return Removal::Secondary { owner };
        }

        if state.tertiaries.remove(&id).is_some() {
            trace!(connection_id = %id, "Tertiary unregistered");
            return Removal::Tertiary;
        }

        Removal::NotRegistered
    }
}

// ============================================================================
// ConnectionRegistry - Lookup
// ============================================================================

impl ConnectionRegistry {
    /// Returns the secondaries owned by `primary_id`, or `None` if it is not
    /// registered.
    #[must_use]
    pub fn lookup(&self, primary_id: ConnectionId) -> Option<Vec<ConnectionHandle>> {
        self.state
            .read()
            .primaries
            .get(&primary_id)
            .map(|entry| entry.secondaries.values().cloned().collect())
    }

    /// Returns the primary owning `secondary_id`.
    #[must_use]
    pub fn owner_of(&self, secondary_id: ConnectionId) -> Option<ConnectionHandle> {
        let state = self.state.read();
        let owner = state.owners.get(&secondary_id)?;
        state
            .primaries
            .get(owner)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Returns a registered connection of any kind.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let state = self.state.read();
        if let Some(entry) = state.primaries.get(&id) {
            return Some(Arc::clone(&entry.connection));
        }
        if let Some(owner) = state.owners.get(&id) {
            return state
                .primaries
                .get(owner)
                .and_then(|entry| entry.secondaries.get(&id))
                .cloned();
        }
        state.tertiaries.get(&id).cloned()
    }

    /// Returns `true` if `id` is registered under any kind.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        let state = self.state.read();
        state.primaries.contains_key(&id)
            || state.owners.contains_key(&id)
            || state.tertiaries.contains_key(&id)
    }

    /// Event lane of a registered primary.
    pub(crate) fn lane(&self, primary_id: ConnectionId) -> Option<EventLane> {
        self.state
            .read()
            .primaries
            .get(&primary_id)
            .map(|entry| Arc::clone(&entry.lane))
    }

    /// Event lane of the primary owning `secondary_id`.
    pub(crate) fn owner_lane(&self, secondary_id: ConnectionId) -> Option<EventLane> {
        let state = self.state.read();
        let owner = state.owners.get(&secondary_id)?;
        state
            .primaries
            .get(owner)
            .map(|entry| Arc::clone(&entry.lane))
    }
}

// ============================================================================
// ConnectionRegistry - Snapshots
// ============================================================================

impl ConnectionRegistry {
    /// Snapshot of all primaries.
    #[must_use]
    pub fn primaries(&self) -> Vec<ConnectionHandle> {
        self.state
            .read()
            .primaries
            .values()
            .map(|entry| Arc::clone(&entry.connection))
            .collect()
    }

    /// Snapshot of all secondaries across all owners.
    #[must_use]
    pub fn secondaries(&self) -> Vec<ConnectionHandle> {
        self.state
            .read()
            .primaries
            .values()
            .flat_map(|entry| entry.secondaries.values().cloned())
            .collect()
    }

    /// Snapshot of all tertiaries.
    #[must_use]
    pub fn tertiaries(&self) -> Vec<ConnectionHandle> {
        self.state.read().tertiaries.values().cloned().collect()
    }

    /// Snapshot of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: TransportKind) -> Vec<ConnectionHandle> {
        match kind {
            TransportKind::Primary => self.primaries(),
            TransportKind::Secondary => self.secondaries(),
            TransportKind::Tertiary => self.tertiaries(),
        }
    }

    /// Number of registered connections of one kind.
    #[must_use]
    pub fn count(&self, kind: TransportKind) -> usize {
        let state = self.state.read();
        match kind {
            TransportKind::Primary => state.primaries.len(),
            TransportKind::Secondary => state.owners.len(),
            TransportKind::Tertiary => state.tertiaries.len(),
        }
    }

    /// Number of registered connections of all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.read();
        state.primaries.len() + state.owners.len() + state.tertiaries.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
