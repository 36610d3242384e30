//! Outbound send pipeline.
//!
//! Every connection owns one pipeline. Frames are queued FIFO under the
//! connection's send lock and written by at most one writer task at a time.
//! When a write completes the writer coalesces everything queued so far into
//! the connection's send buffer and issues the next write, so a burst of
//! small packets costs a handful of syscalls instead of one each. Frames are
//! never reordered and never split between two batches.

use super::buffer::PooledBuffer;
use super::close::CloseSignal;
use super::connection::ConnectionId;
use crate::codec::FrameError;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Write half of a connection's transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes slower than this are reported.
const SLOW_WRITE: Duration = Duration::from_millis(100);

/// Errors returned to code that queues outbound packets.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,

    #[error("packet 0x{code:02X} of {size} bytes exceeds the {limit} byte frame limit")]
    Oversized { code: u8, size: usize, limit: usize },

    #[error(transparent)]
    Frame(#[from] FrameError),
}

struct SendQueue {
    frames: VecDeque<Bytes>,
    in_flight: bool,
}

struct Wire {
    writer: Option<BoxedWriter>,
    buffer: PooledBuffer,
}

/// What the writer task puts on the wire next.
#[derive(Debug, PartialEq, Eq)]
enum Batch {
    /// Nothing queued.
    Empty,
    /// `frames` frames copied into the send buffer, `len` bytes in total.
    Coalesced { len: usize, frames: usize },
    /// A frame larger than the send buffer, written on its own.
    Single(Bytes),
}

/// Move queued frames into `buffer`, oldest first, until the next one would
/// not fit.
fn coalesce(queue: &mut VecDeque<Bytes>, buffer: &mut [u8]) -> Batch {
    let Some(first) = queue.pop_front() else {
        return Batch::Empty;
    };
    if first.len() > buffer.len() {
        return Batch::Single(first);
    }

    buffer[..first.len()].copy_from_slice(&first);
    let mut len = first.len();
    let mut frames = 1;

    while let Some(next) = queue.front() {
        if len + next.len() > buffer.len() {
            break;
        }
        buffer[len..len + next.len()].copy_from_slice(next);
        len += next.len();
        frames += 1;
        queue.pop_front();
    }

    Batch::Coalesced { len, frames }
}

/// Per-connection outbound queue with single-flight writes.
pub struct SendPipeline {
    conn_id: ConnectionId,
    queue: Mutex<SendQueue>,
    wire: tokio::sync::Mutex<Wire>,
    closed: Arc<CloseSignal>,
    idle: Notify,
    runtime: Handle,
}

impl SendPipeline {
    /// Build a pipeline writing to `writer` and coalescing into `buffer`.
    ///
    /// Must be called from within a tokio runtime; writer tasks are spawned
    /// onto that runtime even when packets are queued from other threads.
    pub fn new(
        conn_id: ConnectionId,
        writer: BoxedWriter,
        buffer: PooledBuffer,
        closed: Arc<CloseSignal>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn_id,
            queue: Mutex::new(SendQueue {
                frames: VecDeque::new(),
                in_flight: false,
            }),
            wire: tokio::sync::Mutex::new(Wire {
                writer: Some(writer),
                buffer,
            }),
            closed,
            idle: Notify::new(),
            runtime: Handle::current(),
        })
    }

    /// Queue a finished frame. Never blocks on the socket.
    pub fn enqueue(self: &Arc<Self>, frame: Bytes) -> Result<(), SendError> {
        if self.closed.is_closed() {
            return Err(SendError::Closed);
        }

        {
            let mut queue = self.lock_queue();
            queue.frames.push_back(frame);
            if queue.in_flight {
                return Ok(());
            }
            queue.in_flight = true;
        }

        let pipeline = Arc::clone(self);
        self.runtime.spawn(async move { pipeline.drain().await });
        Ok(())
    }

    /// Number of frames waiting behind the in-flight write.
    pub fn queued(&self) -> usize {
        self.lock_queue().frames.len()
    }

    /// True when nothing is queued and no write is in flight.
    pub fn is_idle(&self) -> bool {
        let queue = self.lock_queue();
        queue.frames.is_empty() && !queue.in_flight
    }

    /// Wait until every queued frame has been written, or the connection
    /// closed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_idle() || self.closed.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Shut the write half down. Queued frames are discarded.
    pub(crate) fn shutdown(self: &Arc<Self>) {
        let pipeline = Arc::clone(self);
        self.runtime.spawn(async move {
            // the writer task observes the close signal and releases the wire
            let mut wire = pipeline.wire.lock().await;
            if let Some(mut writer) = wire.writer.take() {
                if let Err(e) = writer.shutdown().await {
                    trace!(conn = %pipeline.conn_id, error = %e, "Write half shutdown failed");
                }
            }
            pipeline.abandon();
        });
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, SendQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writer task body: the send-completion loop.
    async fn drain(self: Arc<Self>) {
        let mut wire = self.wire.lock().await;

        loop {
            let Wire { writer, buffer } = &mut *wire;

            let batch = {
                let mut queue = self.lock_queue();
                let batch = coalesce(&mut queue.frames, buffer);
                if batch == Batch::Empty {
                    queue.in_flight = false;
                }
                batch
            };

            let bytes: &[u8] = match &batch {
                Batch::Empty => {
                    self.idle.notify_waiters();
                    return;
                }
                Batch::Coalesced { len, frames } => {
                    trace!(conn = %self.conn_id, len, frames, "Writing coalesced batch");
                    &buffer[..*len]
                }
                Batch::Single(frame) => frame,
            };

            let Some(writer) = writer.as_mut() else {
                self.abandon();
                return;
            };

            let started = Instant::now();
            let result = tokio::select! {
                result = writer.write_all(bytes) => result,
                _ = self.closed.wait() => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection closed during write",
                )),
            };

            let took = started.elapsed();
            if took > SLOW_WRITE {
                warn!(
                    conn = %self.conn_id,
                    elapsed_ms = took.as_millis() as u64,
                    bytes = bytes.len(),
                    "Socket write was slow"
                );
            }

            if let Err(e) = result {
                debug!(conn = %self.conn_id, error = %e, "Send failed, closing connection");
                self.closed.close();
                // close() skips shutdown once the flag is set
                if let Some(mut writer) = wire.writer.take() {
                    if let Err(e) = writer.shutdown().await {
                        trace!(conn = %self.conn_id, error = %e, "Write half shutdown failed");
                    }
                }
                self.abandon();
                return;
            }
        }
    }

    /// Drop whatever is queued after a transport fault or close.
    fn abandon(&self) {
        {
            let mut queue = self.lock_queue();
            queue.frames.clear();
            queue.in_flight = false;
        }
        self.idle.notify_waiters();
    }
}

impl std::fmt::Debug for SendPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPipeline")
            .field("conn_id", &self.conn_id)
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::buffer::BufferPool;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(tag: u8, len: usize) -> Bytes {
        Bytes::from(vec![tag; len])
    }

    #[test]
    fn test_coalesce_fills_in_order() {
        let mut queue: VecDeque<Bytes> = [frame(1, 4), frame(2, 4), frame(3, 4)].into();
        let mut buffer = [0u8; 10];

        assert_eq!(
            coalesce(&mut queue, &mut buffer),
            Batch::Coalesced { len: 8, frames: 2 }
        );
        assert_eq!(&buffer[..8], &[1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(queue.len(), 1);

        assert_eq!(
            coalesce(&mut queue, &mut buffer),
            Batch::Coalesced { len: 4, frames: 1 }
        );
        assert_eq!(coalesce(&mut queue, &mut buffer), Batch::Empty);
    }

    #[test]
    fn test_coalesce_oversized_frame_alone() {
        let big = frame(9, 32);
        let mut queue: VecDeque<Bytes> = [big.clone(), frame(1, 2)].into();
        let mut buffer = [0u8; 16];

        assert_eq!(coalesce(&mut queue, &mut buffer), Batch::Single(big));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_coalesce_stops_before_oversized() {
        let mut queue: VecDeque<Bytes> = [frame(1, 4), frame(9, 32), frame(2, 2)].into();
        let mut buffer = [0u8; 16];

        assert_eq!(
            coalesce(&mut queue, &mut buffer),
            Batch::Coalesced { len: 4, frames: 1 }
        );
        assert_eq!(queue.front().map(|f| f.len()), Some(32));
    }

    #[tokio::test]
    async fn test_queued_frames_coalesce_into_one_write() {
        let a = frame(0xA, 5);
        let b = frame(0xB, 6);
        let c = frame(0xC, 7);
        let expected = [a.as_ref(), b.as_ref(), c.as_ref()].concat();

        // the current-thread runtime does not run the writer task until we
        // yield, so all three frames are queued behind the first enqueue
        let mock = tokio_test::io::Builder::new().write(&expected).build();
        let pool = BufferPool::new(1, 64);
        let pipeline = SendPipeline::new(
            ConnectionId(1),
            Box::new(mock),
            pool.acquire(),
            Arc::new(CloseSignal::new()),
        );

        pipeline.enqueue(a).unwrap();
        pipeline.enqueue(b).unwrap();
        pipeline.enqueue(c).unwrap();
        assert_eq!(pipeline.queued(), 3);

        pipeline.wait_idle().await;
        assert!(pipeline.is_idle());
    }

    #[tokio::test]
    async fn test_order_preserved_while_in_flight() {
        let (mut client, server) = duplex(16);
        let pool = BufferPool::new(1, 32);
        let pipeline = SendPipeline::new(
            ConnectionId(2),
            Box::new(server),
            pool.acquire(),
            Arc::new(CloseSignal::new()),
        );

        let a = frame(0xA, 24);
        pipeline.enqueue(a.clone()).unwrap();
        // let the writer start; the 16 byte pipe stalls it mid-frame
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let mut expected = a.to_vec();
        for tag in 0..20u8 {
            let f = frame(tag, 3 + (tag as usize % 5));
            expected.extend_from_slice(&f);
            pipeline.enqueue(f).unwrap();
        }
        let big = frame(0xF, 40); // larger than the send buffer
        expected.extend_from_slice(&big);
        pipeline.enqueue(big).unwrap();

        let mut received = vec![0u8; expected.len()];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        pipeline.wait_idle().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let (_client, server) = duplex(64);
        let pool = BufferPool::new(1, 32);
        let closed = Arc::new(CloseSignal::new());
        let pipeline = SendPipeline::new(
            ConnectionId(3),
            Box::new(server),
            pool.acquire(),
            Arc::clone(&closed),
        );

        closed.close();
        assert!(matches!(pipeline.enqueue(frame(1, 1)), Err(SendError::Closed)));
    }

    #[tokio::test]
    async fn test_write_error_closes() {
        let (client, server) = duplex(64);
        drop(client);

        let pool = BufferPool::new(1, 32);
        let closed = Arc::new(CloseSignal::new());
        let pipeline = SendPipeline::new(
            ConnectionId(4),
            Box::new(server),
            pool.acquire(),
            Arc::clone(&closed),
        );

        pipeline.enqueue(frame(1, 8)).unwrap();
        tokio::time::timeout(Duration::from_secs(1), closed.wait())
            .await
            .expect("transport fault did not close the connection");
        pipeline.wait_idle().await;
        assert_eq!(pipeline.queued(), 0);
    }

    /// Writer whose every write fails; records how it was torn down.
    #[derive(Default)]
    struct BrokenWriter {
        shut_down: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    impl AsyncWrite for BrokenWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shut_down.store(true, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    impl Drop for BrokenWriter {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_write_error_releases_writer() {
        let writer = BrokenWriter::default();
        let shut_down = Arc::clone(&writer.shut_down);
        let dropped = Arc::clone(&writer.dropped);

        let pool = BufferPool::new(1, 32);
        let closed = Arc::new(CloseSignal::new());
        let pipeline = SendPipeline::new(
            ConnectionId(5),
            Box::new(writer),
            pool.acquire(),
            Arc::clone(&closed),
        );

        pipeline.enqueue(frame(1, 8)).unwrap();
        tokio::time::timeout(Duration::from_secs(1), closed.wait())
            .await
            .expect("transport fault did not close the connection");
        pipeline.wait_idle().await;
        // the close flag is already set, so nothing else will tear it down
        assert!(!closed.close());

        assert!(shut_down.load(Ordering::SeqCst));
        assert!(dropped.load(Ordering::SeqCst));
    }
}
