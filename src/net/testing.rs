//! Connections over in-memory pipes, for unit tests.

use super::buffer::BufferPool;
use super::connection::{Connection, ConnectionId, SendLimits};
use crate::session::NoopObserver;
use crate::stats::NetStats;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{duplex, DuplexStream};

pub(crate) fn test_peer(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// A connection with no receive loop; the returned stream is the client
/// side of its write half.
pub(crate) fn detached_connection(id: usize) -> (Arc<Connection>, DuplexStream) {
    detached_connection_with(id, SendLimits::default())
}

pub(crate) fn detached_connection_with(
    id: usize,
    limits: SendLimits,
) -> (Arc<Connection>, DuplexStream) {
    let (client, server) = duplex(64 * 1024);
    let pool = BufferPool::new(1, 4096);
    let conn = Connection::new(
        ConnectionId(id),
        test_peer(40_000 + id as u16),
        Box::new(server),
        pool.acquire(),
        Arc::new(NoopObserver),
        Arc::new(NetStats::new()),
        limits,
    );
    (conn, client)
}
