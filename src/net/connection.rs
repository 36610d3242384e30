//! One client connection: identity, session, negotiated protocol and the
//! outbound side.

use super::buffer::PooledBuffer;
use super::close::CloseSignal;
use super::history::{Direction, PacketHistory, PacketRecord};
use super::send::{BoxedWriter, SendError, SendPipeline};
use crate::codec::{hex_dump, PacketEncoding, PacketIn, PacketOut, PlainEncoding, FRAME_OVERHEAD};
use crate::dispatch::DispatchTable;
use crate::session::{Session, SessionObserver};
use crate::stats::NetStats;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, enabled, error, trace, warn, Level};

/// Registry slot of a connection. Unique among live connections; reused
/// after a connection leaves the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What to do when a handler builds a frame larger than the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Log and discard the packet; the connection stays up.
    #[default]
    Drop,
    /// Log and close the connection.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendLimits {
    pub max_packet_size: usize,
    pub oversize_policy: OversizePolicy,
}

impl Default for SendLimits {
    fn default() -> Self {
        Self {
            max_packet_size: crate::codec::MAX_FRAME_SIZE,
            oversize_policy: OversizePolicy::Drop,
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    session: Session,
    table: OnceLock<Arc<DispatchTable>>,
    pipeline: Arc<SendPipeline>,
    closed: Arc<CloseSignal>,
    history: PacketHistory,
    /// Unix milliseconds of the last socket read.
    last_receive: AtomicI64,
    limits: SendLimits,
    stats: Arc<NetStats>,
}

impl Connection {
    /// Build a connection around the write half of its transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        writer: BoxedWriter,
        send_buffer: PooledBuffer,
        observer: Arc<dyn SessionObserver>,
        stats: Arc<NetStats>,
        limits: SendLimits,
    ) -> Arc<Self> {
        let closed = Arc::new(CloseSignal::new());
        let now = Utc::now();
        Arc::new(Self {
            id,
            peer,
            connected_at: now,
            session: Session::new(id, observer),
            table: OnceLock::new(),
            pipeline: SendPipeline::new(id, writer, send_buffer, Arc::clone(&closed)),
            closed,
            history: PacketHistory::new(),
            last_receive: AtomicI64::new(now.timestamp_millis()),
            limits,
            stats,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Negotiated protocol version, once the handshake is done.
    pub fn version(&self) -> Option<u32> {
        self.table.get().map(|table| table.version())
    }

    pub fn dispatch_table(&self) -> Option<&Arc<DispatchTable>> {
        self.table.get()
    }

    /// Fix the protocol for the rest of the connection's life. Returns
    /// `false` if it was already set.
    pub(crate) fn set_dispatch_table(&self, table: Arc<DispatchTable>) -> bool {
        self.table.set(table).is_ok()
    }

    /// Payload encoding in effect. Plain until the handshake completes.
    pub fn encoding(&self) -> &dyn PacketEncoding {
        match self.table.get() {
            Some(table) => table.encoding(),
            None => &PlainEncoding,
        }
    }

    /// Finish `packet` with this connection's encoding and queue it.
    ///
    /// Never blocks on the socket. Frames over the configured limit are
    /// handled per [`OversizePolicy`] and reported as
    /// [`SendError::Oversized`].
    pub fn send(&self, packet: PacketOut) -> Result<(), SendError> {
        let code = packet.code();
        let size = packet.frame_len();
        if size > self.frame_limit() {
            return Err(self.reject_oversized(code, size, packet.payload()));
        }

        let record = PacketRecord::new(Direction::Outbound, code, packet.payload());
        if enabled!(Level::TRACE) {
            trace!(
                conn = %self.id,
                "{}",
                hex_dump(&format!("===> 0x{code:02X}"), packet.payload())
            );
        }

        let frame = packet.finish(self.encoding())?;
        let len = frame.len();
        self.pipeline.enqueue(frame)?;
        self.history.record(record);
        self.stats.record_out(len);
        Ok(())
    }

    /// Queue an already finished frame as is.
    pub fn send_raw(&self, frame: Bytes) -> Result<(), SendError> {
        if frame.len() > self.frame_limit() {
            let code = frame.get(2).copied().unwrap_or_default();
            return Err(self.reject_oversized(code, frame.len(), &frame));
        }
        let len = frame.len();
        self.pipeline.enqueue(frame)?;
        self.stats.record_out(len);
        Ok(())
    }

    /// Largest frame this connection sends: the configured limit, capped
    /// by what the 16-bit length field can describe.
    fn frame_limit(&self) -> usize {
        self.limits
            .max_packet_size
            .min(u16::MAX as usize + FRAME_OVERHEAD)
    }

    fn reject_oversized(&self, code: u8, size: usize, payload: &[u8]) -> SendError {
        let limit = self.frame_limit();
        error!(
            conn = %self.id,
            peer = %self.peer,
            size,
            limit,
            policy = ?self.limits.oversize_policy,
            "Packet 0x{code:02X} exceeds the frame limit\n{}",
            hex_dump("oversized packet", payload)
        );
        if self.limits.oversize_policy == OversizePolicy::Disconnect {
            self.close();
        }
        SendError::Oversized { code, size, limit }
    }

    /// Frames queued and not yet handed to the socket.
    pub fn queued_packets(&self) -> usize {
        self.pipeline.queued()
    }

    /// Resolve once everything queued so far has been written.
    pub async fn flush(&self) {
        self.pipeline.wait_idle().await
    }

    /// Close once the outbound queue drains.
    pub fn close_after_flush(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.pipeline.wait_idle().await;
            conn.close();
        });
    }

    /// Close the transport. Idempotent; only the first call returns `true`.
    ///
    /// This does not remove the connection from the registry. The receive
    /// loop notices and runs the disconnect path.
    pub fn close(&self) -> bool {
        if !self.closed.close() {
            return false;
        }
        debug!(conn = %self.id, peer = %self.peer, "Closing connection");
        self.pipeline.shutdown();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub(crate) fn closed(&self) -> &CloseSignal {
        &self.closed
    }

    pub(crate) fn record_inbound(&self, packet: &PacketIn) {
        self.history.record(PacketRecord::new(
            Direction::Inbound,
            packet.code(),
            packet.payload(),
        ));
    }

    /// Recent packets, oldest first.
    pub fn history(&self) -> Vec<PacketRecord> {
        self.history.snapshot()
    }

    pub(crate) fn mark_receive(&self) {
        self.last_receive
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Unix milliseconds of the last socket read.
    pub fn last_receive(&self) -> i64 {
        self.last_receive.load(Ordering::Acquire)
    }

    /// Log the recent packet history, used when a connection faults.
    pub(crate) fn log_history(&self) {
        let history = self.history.snapshot();
        if history.is_empty() {
            return;
        }
        warn!(conn = %self.id, peer = %self.peer, "Last {} packets:", history.len());
        for record in history {
            warn!(conn = %self.id, "{record}");
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.peer)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.session.state())
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_frames;
    use crate::net::buffer::BufferPool;
    use crate::net::testing::{detached_connection, detached_connection_with, test_peer};
    use crate::session::NoopObserver;
    use std::ops::ControlFlow;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(12).to_string(), "#12");
    }

    #[tokio::test]
    async fn test_send_writes_frame() {
        let (conn, mut peer) = detached_connection(1);
        let mut packet = PacketOut::new(0x29);
        packet.write_u32(0xDEADBEEF);
        conn.send(packet).unwrap();
        conn.flush().await;

        let mut wire = vec![0u8; 4 + FRAME_OVERHEAD];
        peer.read_exact(&mut wire).await.unwrap();

        let mut seen = Vec::new();
        let carried = decode_frames(&mut wire, 4 + FRAME_OVERHEAD, &PlainEncoding, |p| {
            seen.push(p);
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(carried, 0);
        assert_eq!(seen[0].code(), 0x29);
        assert_eq!(&seen[0].payload()[..], &[0xDE, 0xAD, 0xBE, 0xEF]);

        let history = conn.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].direction, Direction::Outbound);
    }

    #[tokio::test]
    async fn test_oversized_dropped() {
        let limits = SendLimits {
            max_packet_size: 32,
            oversize_policy: OversizePolicy::Drop,
        };
        let (conn, _peer) = detached_connection_with(2, limits);
        let mut packet = PacketOut::new(0x10);
        packet.fill(0xAA, 64);

        match conn.send(packet) {
            Err(SendError::Oversized { code, size, limit }) => {
                assert_eq!(code, 0x10);
                assert_eq!(size, 64 + FRAME_OVERHEAD);
                assert_eq!(limit, 32);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!conn.is_closed());
        assert_eq!(conn.queued_packets(), 0);
        assert!(conn.history().is_empty());
    }

    #[tokio::test]
    async fn test_limit_capped_by_length_field() {
        let limits = SendLimits {
            max_packet_size: usize::MAX,
            oversize_policy: OversizePolicy::Drop,
        };
        let (conn, _peer) = detached_connection_with(8, limits);
        let mut packet = PacketOut::with_capacity(0x10, 70_000);
        packet.fill(0x01, 70_000);

        match conn.send(packet) {
            Err(SendError::Oversized { size, limit, .. }) => {
                assert_eq!(size, 70_000 + FRAME_OVERHEAD);
                assert_eq!(limit, u16::MAX as usize + FRAME_OVERHEAD);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!conn.is_closed());
        assert_eq!(conn.queued_packets(), 0);
    }

    #[tokio::test]
    async fn test_oversized_disconnects() {
        let limits = SendLimits {
            max_packet_size: 32,
            oversize_policy: OversizePolicy::Disconnect,
        };
        let (conn, _peer) = detached_connection_with(3, limits);
        let mut packet = PacketOut::new(0x10);
        packet.fill(0, 64);

        assert!(conn.send(packet).is_err());
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(PacketOut::new(0x11)),
            Err(SendError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, mut peer) = detached_connection(4);
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());

        // the write half is shut down, the peer sees EOF
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(std::time::Duration::from_secs(1), peer.read(&mut buf))
            .await
            .expect("peer never saw the close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_close_after_flush_delivers_queued() {
        let (conn, mut peer) = detached_connection(5);
        for code in 0..4u8 {
            conn.send(PacketOut::new(code)).unwrap();
        }
        conn.close_after_flush();

        let mut wire = Vec::new();
        peer.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire.len(), 4 * FRAME_OVERHEAD);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_send_not_counted() {
        let stats = Arc::new(NetStats::new());
        let (_client, server) = tokio::io::duplex(1024);
        let pool = BufferPool::new(1, 4096);
        let conn = Connection::new(
            ConnectionId(7),
            test_peer(7),
            Box::new(server),
            pool.acquire(),
            Arc::new(NoopObserver),
            Arc::clone(&stats),
            SendLimits::default(),
        );
        conn.close();

        assert!(matches!(
            conn.send(PacketOut::new(0x11)),
            Err(SendError::Closed)
        ));
        assert!(matches!(
            conn.send_raw(PacketOut::new(0x12).finish(&PlainEncoding).unwrap()),
            Err(SendError::Closed)
        ));
        assert_eq!(stats.snapshot().packets_out, 0);
        assert_eq!(stats.snapshot().bytes_out, 0);
        assert!(conn.history().is_empty());
    }

    #[tokio::test]
    async fn test_encoding_defaults_to_plain() {
        let (conn, _peer) = detached_connection(6);
        assert_eq!(conn.encoding().name(), "plain");
        assert_eq!(conn.version(), None);
    }
}
