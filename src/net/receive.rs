//! Per-connection receive loop.
//!
//! Reads into a pooled buffer at the offset after any carried partial
//! frame, negotiates the protocol from the first complete frame, then
//! hands every verified packet to the connection's dispatch table in
//! arrival order. Any protocol fault or transport error ends the loop and
//! runs the server's disconnect path exactly once.

use super::connection::Connection;
use crate::codec::{decode_frames, frame_len, hex_dump, FrameError, PlainEncoding};
use crate::dispatch::DispatchTable;
use crate::server::ServerContext;
use crate::session::{detect_version, HandshakeError, SessionState};
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, trace, warn};

/// Read half of a connection's transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Faults in the byte stream itself. All are fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolFault {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

#[derive(Debug)]
enum CloseReason {
    /// The peer closed its side.
    Eof,
    Transport(io::Error),
    Protocol(ProtocolFault),
    /// Closed from our side (kick, stop, send failure).
    Local,
}

pub(crate) async fn receive_loop(
    conn: Arc<Connection>,
    mut reader: BoxedReader,
    ctx: Arc<ServerContext>,
) {
    let mut buffer = ctx.pool().acquire();
    let mut filled = 0;

    let reason = loop {
        let read = tokio::select! {
            biased;
            _ = conn.closed().wait() => break CloseReason::Local,
            read = reader.read(&mut buffer[filled..]) => read,
        };

        let n = match read {
            Ok(0) => break CloseReason::Eof,
            Ok(n) => n,
            Err(e) => break CloseReason::Transport(e),
        };

        ctx.observer().on_receive(&conn, n);
        conn.mark_receive();

        match process(&conn, &ctx, &mut buffer, filled + n) {
            Ok(carried) => filled = carried,
            Err(fault) => {
                report_fault(&conn, &fault, &buffer[..filled + n]);
                break CloseReason::Protocol(fault);
            }
        }

        if conn.is_closed() {
            break CloseReason::Local;
        }
    };

    match reason {
        CloseReason::Eof => debug!(conn = %conn.id(), "Connection closed by client"),
        CloseReason::Transport(e) => {
            debug!(conn = %conn.id(), error = %e, "Connection error")
        }
        CloseReason::Protocol(fault) => {
            debug!(conn = %conn.id(), error = %fault, "Dropping connection after protocol fault")
        }
        CloseReason::Local => trace!(conn = %conn.id(), "Receive loop stopped"),
    }

    ctx.disconnect(&conn);
}

/// Consume whatever complete frames `buffer[..end]` holds. Returns the
/// number of carried bytes now at the front of the buffer.
fn process(
    conn: &Arc<Connection>,
    ctx: &ServerContext,
    buffer: &mut [u8],
    mut end: usize,
) -> Result<usize, ProtocolFault> {
    let table = match conn.dispatch_table() {
        Some(table) => Arc::clone(table),
        None => {
            let Some(hello_len) = frame_len(&buffer[..end]) else {
                return Ok(end);
            };
            if hello_len > buffer.len() {
                return Err(FrameError::Oversized {
                    frame_len: hello_len,
                    capacity: buffer.len(),
                }
                .into());
            }
            if end < hello_len {
                return Ok(end);
            }

            let table = negotiate(conn, ctx, &buffer[..hello_len])?;

            // the hello frame is always sent in plaintext
            decode_frames(&mut buffer[..hello_len], hello_len, &PlainEncoding, |packet| {
                table.dispatch(conn, &packet);
                ControlFlow::Continue(())
            })?;
            if conn.is_closed() {
                return Ok(0);
            }
            buffer.copy_within(hello_len..end, 0);
            end -= hello_len;
            table
        }
    };

    let carried = decode_frames(buffer, end, table.encoding(), |packet| {
        table.dispatch(conn, &packet);
        if conn.is_closed() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    Ok(carried)
}

/// Fix the connection's protocol from its hello frame.
fn negotiate(
    conn: &Connection,
    ctx: &ServerContext,
    hello: &[u8],
) -> Result<Arc<DispatchTable>, ProtocolFault> {
    let version = detect_version(hello)?;
    let table = ctx
        .dispatch()
        .table_for(version)
        .ok_or(HandshakeError::UnsupportedVersion(version))?;

    conn.set_dispatch_table(Arc::clone(&table));
    if let Err(e) = conn.session().transition(SessionState::Connecting) {
        warn!(conn = %conn.id(), error = %e, "Handshake on a session that already moved on");
    }
    info!(
        conn = %conn.id(),
        peer = %conn.peer(),
        version,
        encoding = table.encoding().name(),
        "Incoming connection using client version"
    );
    Ok(table)
}

fn report_fault(conn: &Connection, fault: &ProtocolFault, received: &[u8]) {
    warn!(
        conn = %conn.id(),
        peer = %conn.peer(),
        version = ?conn.version(),
        state = %conn.session().state(),
        error = %fault,
        "Protocol fault, disconnecting"
    );
    conn.log_history();
    debug!(conn = %conn.id(), "{}", hex_dump("receive buffer", received));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PacketOut;
    use crate::config::Config;
    use crate::dispatch::{handler_fn, HandlerCatalog, Requirement, VersionSpec};
    use crate::net::testing::test_peer;
    use crate::session::{legacy_hello, NoopObserver, HANDSHAKE_CODE};
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    type Seen = Arc<Mutex<Vec<(u8, Bytes)>>>;

    fn context(seen: Seen) -> Arc<ServerContext> {
        let mut catalog = HandlerCatalog::new();
        catalog.add_version(VersionSpec::new(100));
        for code in [HANDSHAKE_CODE, 0x10, 0x11] {
            let seen = seen.clone();
            catalog.register(
                100,
                code,
                Requirement::None,
                handler_fn(move |_, packet| {
                    seen.lock()
                        .unwrap()
                        .push((packet.code(), packet.payload().clone()));
                    Ok(())
                }),
            );
        }
        ServerContext::new(&Config::default(), catalog, Arc::new(NoopObserver))
    }

    fn frame(code: u8, payload: &[u8]) -> Bytes {
        let mut packet = PacketOut::new(code);
        packet.write_bytes(payload);
        packet.finish(&PlainEncoding).unwrap()
    }

    async fn wait_closed(conn: &Connection) {
        tokio::time::timeout(Duration::from_secs(2), conn.closed().wait())
            .await
            .expect("connection never closed");
    }

    #[tokio::test]
    async fn test_partial_reads_reassembled() {
        let seen: Seen = Default::default();
        let ctx = context(seen.clone());

        let hello = legacy_hello(100).finish(&PlainEncoding).unwrap();
        let a = frame(0x10, b"first");
        let b = frame(0x11, b"second");
        let stream = [hello.as_ref(), a.as_ref(), b.as_ref()].concat();

        // hello split across reads, then a read holding the tail of the
        // hello and half of the next frame
        let reader = tokio_test::io::Builder::new()
            .read(&stream[..4])
            .read(&stream[4..20])
            .read(&stream[20..25])
            .read(&stream[25..])
            .build();
        let (_client, server) = tokio::io::duplex(1024);
        let conn = ctx
            .attach(Box::new(reader), Box::new(server), test_peer(1))
            .unwrap();

        wait_closed(&conn).await;
        let seen = seen.lock().unwrap().clone();
        let codes: Vec<u8> = seen.iter().map(|(code, _)| *code).collect();
        assert_eq!(codes, vec![HANDSHAKE_CODE, 0x10, 0x11]);
        assert_eq!(&seen[1].1[..], b"first");
        assert_eq!(&seen[2].1[..], b"second");
        assert_eq!(conn.version(), Some(100));
    }

    #[tokio::test]
    async fn test_short_hello_disconnects() {
        let seen: Seen = Default::default();
        let ctx = context(seen.clone());
        let (mut client, server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server);
        let conn = ctx
            .attach(Box::new(reader), Box::new(writer), test_peer(2))
            .unwrap();

        // a complete frame that is too short to carry a version
        client.write_all(&frame(HANDSHAKE_CODE, b"hi")).await.unwrap();

        wait_closed(&conn).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(conn.session().state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_oversized_hello_disconnects() {
        let seen: Seen = Default::default();
        let ctx = context(seen.clone());
        let (mut client, server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server);
        let conn = ctx
            .attach(Box::new(reader), Box::new(writer), test_peer(3))
            .unwrap();

        // announces a payload far larger than the receive buffer
        client.write_all(&[0xFF, 0xFF, HANDSHAKE_CODE]).await.unwrap();

        wait_closed(&conn).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(ctx.registry().len(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_stops_after_close() {
        let seen: Seen = Default::default();
        let mut catalog = HandlerCatalog::new();
        catalog.add_version(VersionSpec::new(100)).register(
            100,
            0x10,
            Requirement::None,
            handler_fn(|conn, _| {
                conn.close();
                Ok(())
            }),
        );
        {
            let seen = seen.clone();
            catalog.register(
                100,
                0x11,
                Requirement::None,
                handler_fn(move |_, packet| {
                    seen.lock().unwrap().push((packet.code(), packet.payload().clone()));
                    Ok(())
                }),
            );
        }
        let ctx = ServerContext::new(&Config::default(), catalog, Arc::new(NoopObserver));

        let hello = legacy_hello(100).finish(&PlainEncoding).unwrap();
        let kick = frame(0x10, b"");
        let after = frame(0x11, b"late");
        let stream = [hello.as_ref(), kick.as_ref(), after.as_ref()].concat();
        let (mut client, server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server);
        let conn = ctx
            .attach(Box::new(reader), Box::new(writer), test_peer(4))
            .unwrap();
        client.write_all(&stream).await.unwrap();

        wait_closed(&conn).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(conn.history().len(), 2);
    }
}
