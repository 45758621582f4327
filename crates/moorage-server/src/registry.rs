//! Live-connection registry.
//!
//! The registry is the authoritative set of currently open connections:
//! the accept loop inserts an entry the moment a socket is accepted, and
//! the connection task owns removal (via a drop guard, so the entry is
//! released on every exit path, including a task future that is dropped
//! before it ever runs). Shutdown draining enumerates the registry until
//! it is observably empty.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Global counter for connection IDs. Relaxed ordering is sufficient since
/// only uniqueness matters.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next connection ID.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One currently-open connection.
///
/// Carries the connection's cancellation token so the drain loop can close
/// the transport: cancelling the token tears the owning task down, which
/// drops the socket.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    id: ConnectionId,
    peer: SocketAddr,
    token: CancellationToken,
}

impl ConnectionEntry {
    /// Creates an entry for an accepted socket.
    #[must_use]
    pub fn new(id: ConnectionId, peer: SocketAddr, token: CancellationToken) -> Self {
        Self { id, peer, token }
    }

    /// Returns the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the peer address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Delivers the connection's cancellation signal. Idempotent.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the connection's cancellation signal has fired.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Concurrent set of open connections.
///
/// Cheap to clone; all clones share the same underlying set. Safe for
/// concurrent add/remove from connection tasks and concurrent snapshots
/// from the shutdown sequencer. No ordering guarantee among entries.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<ConnectionId, ConnectionEntry>>>,
    removed: Arc<Notify>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts an entry. A second insert for the same ID replaces the first;
    /// the accept loop never produces duplicates.
    pub fn add(&self, entry: ConnectionEntry) {
        self.lock().insert(entry.id(), entry);
    }

    /// Removes an entry. Removing an absent ID is a no-op.
    pub fn remove(&self, id: ConnectionId) {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            self.removed.notify_waiters();
        }
    }

    /// Returns a point-in-time copy of the entries, safe to iterate while
    /// concurrent add/remove proceeds.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionEntry> {
        self.lock().values().cloned().collect()
    }

    /// Returns the number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no connections are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolves after the next removal. Used by the drain loop to wait
    /// without polling hot; callers must re-check emptiness afterwards.
    pub(crate) async fn changed(&self) {
        self.removed.notified().await;
    }
}

/// Removes a registry entry when dropped.
///
/// Owned by the connection task; guarantees deregistration even when the
/// task future is dropped before its first poll (e.g. dispatch rejection).
#[derive(Debug)]
pub(crate) struct RegistryGuard {
    registry: ConnectionRegistry,
    id: ConnectionId,
}

impl RegistryGuard {
    pub(crate) fn new(registry: ConnectionRegistry, id: ConnectionId) -> Self {
        Self { registry, id }
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        tracing::trace!(connection = %self.id, "connection deregistered");
    }
}
