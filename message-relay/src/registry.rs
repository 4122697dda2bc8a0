use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tokio::sync::Mutex;

/// Identifier minted by the registry when a connection is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateId(ConnectionId),
}

/// The set of currently live connections.
///
/// Entries are `Weak` handles: the lifecycle task that registered a
/// connection owns it, the registry only looks it up. Every operation runs in
/// the same critical section, so snapshots never observe a half-applied
/// mutation.
pub struct Registry<C> {
    connections: Mutex<BTreeMap<ConnectionId, Weak<C>>>,
    next_id: AtomicU64,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn add(&self, id: ConnectionId, handle: &Arc<C>) -> Result<(), RegistryError> {
        let mut connections = self.connections.lock().await;
        if connections.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        connections.insert(id, Arc::downgrade(handle));
        Ok(())
    }

    /// Removes `id`, returning whether it was present. Removing an absent id
    /// is a no-op.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.remove(&id).is_some()
    }

    /// Point-in-time copy of every entry except `origin`, in registration order.
    pub async fn snapshot_excluding(&self, origin: ConnectionId) -> Vec<(ConnectionId, Weak<C>)> {
        self.connections
            .lock()
            .await
            .iter()
            .filter(|(id, _)| **id != origin)
            .map(|(id, handle)| (*id, Weak::clone(handle)))
            .collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}
