//! Session lifecycle callbacks.
//!
//! Persistence, presence and audit subsystems hook into connection events
//! through [`SessionObserver`]. Every method has a no-op default so an
//! observer only implements what it cares about.

use super::state::SessionState;
use crate::net::{Connection, ConnectionId};
use std::sync::Arc;
use tracing::info;

pub trait SessionObserver: Send + Sync {
    /// A socket was accepted and registered.
    fn on_connect(&self, _conn: &Arc<Connection>) {}

    /// The connection left the registry.
    fn on_disconnect(&self, _conn: &Arc<Connection>) {}

    /// `bytes` raw bytes were read from the socket.
    fn on_receive(&self, _conn: &Arc<Connection>, _bytes: usize) {}

    fn on_state_change(&self, _conn: ConnectionId, _from: SessionState, _to: SessionState) {}

    /// An in-world player lost their transport and entered the grace period.
    fn on_linkdead(&self, _conn: &Arc<Connection>) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Logs connects, disconnects and state changes at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditLog;

impl SessionObserver for AuditLog {
    fn on_connect(&self, conn: &Arc<Connection>) {
        info!(conn = %conn.id(), peer = %conn.peer(), "Session opened");
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        info!(
            conn = %conn.id(),
            peer = %conn.peer(),
            state = %conn.session().state(),
            "Session closed"
        );
    }

    fn on_state_change(&self, conn: ConnectionId, from: SessionState, to: SessionState) {
        info!(%conn, %from, %to, "Session state");
    }

    fn on_linkdead(&self, conn: &Arc<Connection>) {
        info!(conn = %conn.id(), peer = %conn.peer(), "Player went link-dead");
    }
}

/// Fans every event out to several observers, in registration order.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl SessionObserver for ObserverSet {
    fn on_connect(&self, conn: &Arc<Connection>) {
        for observer in &self.observers {
            observer.on_connect(conn);
        }
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        for observer in &self.observers {
            observer.on_disconnect(conn);
        }
    }

    fn on_receive(&self, conn: &Arc<Connection>, bytes: usize) {
        for observer in &self.observers {
            observer.on_receive(conn, bytes);
        }
    }

    fn on_state_change(&self, conn: ConnectionId, from: SessionState, to: SessionState) {
        for observer in &self.observers {
            observer.on_state_change(conn, from, to);
        }
    }

    fn on_linkdead(&self, conn: &Arc<Connection>) {
        for observer in &self.observers {
            observer.on_linkdead(conn);
        }
    }
}
