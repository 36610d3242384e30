//! Connection registry for tracking active client connections.

use super::connection::{Connection, ConnectionId};
use slab::Slab;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Registry of live connections, keyed by slab slot.
///
/// Every operation holds the lock only for the slab manipulation itself;
/// closing sockets and running callbacks happen after it is released.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<Arc<Connection>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(Slab::with_capacity(max_connections)),
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a slot and insert the connection `make` builds for it.
    ///
    /// Returns `None` (without calling `make`) if the registry is at
    /// capacity.
    pub fn insert_with<F>(&self, make: F) -> Option<Arc<Connection>>
    where
        F: FnOnce(ConnectionId) -> Arc<Connection>,
    {
        let mut connections = self.lock();
        if connections.len() >= self.max_connections {
            return None;
        }
        let entry = connections.vacant_entry();
        let conn = make(ConnectionId(entry.key()));
        entry.insert(Arc::clone(&conn));
        Some(conn)
    }

    /// Remove `conn` if it is still registered. Returns `false` if it was
    /// already gone (or its slot now holds a newer connection).
    pub fn remove(&self, conn: &Arc<Connection>) -> bool {
        let mut connections = self.lock();
        let key = conn.id().0;
        match connections.get(key) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                connections.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.lock().get(id.0).cloned()
    }

    /// Check if a connection is registered.
    pub fn contains(&self, conn: &Arc<Connection>) -> bool {
        self.lock()
            .get(conn.id().0)
            .is_some_and(|current| Arc::ptr_eq(current, conn))
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Copy of the live set.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().iter().map(|(_, conn)| Arc::clone(conn)).collect()
    }

    /// Empty the registry, handing back everything that was in it.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.lock().drain().collect()
    }
}
