//! Shared server state handed explicitly to every connection task.

use crate::config::Config;
use crate::dispatch::{DispatchRegistry, HandlerCatalog};
use crate::net::{
    receive_loop, BoxedReader, BoxedWriter, BufferPool, Connection, ConnectionRegistry,
};
use crate::session::{DisconnectOutcome, SessionObserver, SessionState};
use crate::stats::{NetStats, StatsSnapshot};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

/// A player whose transport is gone but whose session is kept for a grace
/// period.
struct LinkDead {
    conn: Arc<Connection>,
    deadline: Instant,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections dropped for not pinging within the idle timeout.
    pub idle: usize,
    /// Link-dead sessions whose grace period ran out.
    pub expired: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.idle == 0 && self.expired == 0
    }
}

pub struct ServerContext {
    config: Config,
    registry: ConnectionRegistry,
    dispatch: DispatchRegistry,
    observer: Arc<dyn SessionObserver>,
    pool: Arc<BufferPool>,
    stats: Arc<NetStats>,
    linkdead: Mutex<Vec<LinkDead>>,
}

impl ServerContext {
    pub fn new(
        config: &Config,
        catalog: HandlerCatalog,
        observer: Arc<dyn SessionObserver>,
    ) -> Arc<Self> {
        let stats = Arc::new(NetStats::new());
        Arc::new(Self {
            registry: ConnectionRegistry::new(config.max_connections),
            dispatch: DispatchRegistry::new(
                catalog,
                config.dispatch_settings(),
                Arc::clone(&stats),
            ),
            observer,
            pool: BufferPool::new(config.pool_buffers, config.buffer_size),
            stats,
            linkdead: Mutex::new(Vec::new()),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn dispatch(&self) -> &DispatchRegistry {
        &self.dispatch
    }

    pub fn observer(&self) -> &Arc<dyn SessionObserver> {
        &self.observer
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Register a transport and start its receive loop.
    ///
    /// Returns `None` when the registry is full; the transport is dropped,
    /// which closes it.
    pub fn attach(
        self: &Arc<Self>,
        reader: BoxedReader,
        writer: BoxedWriter,
        peer: SocketAddr,
    ) -> Option<Arc<Connection>> {
        let send_buffer = self.pool.acquire();
        let Some(conn) = self.registry.insert_with(|id| {
            Connection::new(
                id,
                peer,
                writer,
                send_buffer,
                Arc::clone(&self.observer),
                Arc::clone(&self.stats),
                self.config.send_limits(),
            )
        }) else {
            warn!(
                %peer,
                capacity = self.registry.capacity(),
                "Connection limit reached, dropping client"
            );
            return None;
        };

        self.stats.record_accept();
        debug!(conn = %conn.id(), %peer, "New connection");
        self.observer.on_connect(&conn);
        tokio::spawn(receive_loop(Arc::clone(&conn), reader, Arc::clone(self)));
        Some(conn)
    }

    /// Remove `conn` from the registry, close it and apply the disconnect
    /// policy. Returns `false` if it had already been disconnected.
    pub fn disconnect(&self, conn: &Arc<Connection>) -> bool {
        let removed = self.registry.remove(conn);
        conn.close();
        if removed {
            self.teardown(conn);
        }
        removed
    }

    fn teardown(&self, conn: &Arc<Connection>) {
        self.observer.on_disconnect(conn);
        match conn.session().on_transport_closed() {
            DisconnectOutcome::LinkDead => {
                self.observer.on_linkdead(conn);
                self.lock_linkdead().push(LinkDead {
                    conn: Arc::clone(conn),
                    deadline: Instant::now() + self.config.linkdead_grace,
                });
                info!(
                    conn = %conn.id(),
                    peer = %conn.peer(),
                    grace_secs = self.config.linkdead_grace.as_secs(),
                    "Client went link-dead"
                );
            }
            DisconnectOutcome::TornDown => {
                info!(conn = %conn.id(), peer = %conn.peer(), "Client disconnected");
            }
        }
    }

    fn lock_linkdead(&self) -> MutexGuard<'_, Vec<LinkDead>> {
        self.linkdead.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of sessions waiting out their link-dead grace period.
    pub fn linkdead_count(&self) -> usize {
        self.lock_linkdead()
            .iter()
            .filter(|entry| entry.conn.session().state() == SessionState::LinkDead)
            .count()
    }

    /// Disconnect idle clients and finish expired link-dead sessions.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        if let Some(timeout) = self.config.idle_timeout {
            for conn in self.registry.snapshot() {
                let idle = conn.session().idle_for();
                if idle > timeout {
                    info!(
                        conn = %conn.id(),
                        peer = %conn.peer(),
                        idle_secs = idle.as_secs(),
                        "Client timed out"
                    );
                    if self.disconnect(&conn) {
                        report.idle += 1;
                    }
                }
            }
        }

        let now = Instant::now();
        let expired: Vec<Arc<Connection>> = {
            let mut linkdead = self.lock_linkdead();
            let mut expired = Vec::new();
            linkdead.retain(|entry| {
                // resumed or already torn down elsewhere
                if entry.conn.session().state() != SessionState::LinkDead {
                    return false;
                }
                if entry.deadline <= now {
                    expired.push(Arc::clone(&entry.conn));
                    return false;
                }
                true
            });
            expired
        };

        for conn in expired {
            if conn.session().transition(SessionState::Disconnected).is_ok() {
                info!(conn = %conn.id(), peer = %conn.peer(), "Link-dead grace period expired");
                report.expired += 1;
            }
        }

        report
    }

    /// Close every connection and finish every session. Used on shutdown.
    pub(crate) fn close_all(&self) -> usize {
        let connections = self.registry.drain();
        for conn in &connections {
            conn.close();
            self.teardown(conn);
        }

        // nothing will sweep the link-dead roster after this
        let parked = std::mem::take(&mut *self.lock_linkdead());
        for entry in parked {
            let _ = entry.conn.session().transition(SessionState::Disconnected);
        }
        connections.len()
    }
}
