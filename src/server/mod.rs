//! TCP front door: listener, accept loop and maintenance task.
//!
//! Accepted sockets are tuned, registered and handed a receive loop; all
//! per-connection work happens in those tasks. `stop` closes the listener
//! first and then every live connection.

mod context;

pub use context::{ServerContext, SweepReport};

use crate::config::{Config, ConfigError};
use crate::dispatch::HandlerCatalog;
use crate::net::{CloseSignal, Connection};
use crate::session::SessionObserver;
use crate::stats::StatsSnapshot;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Pause after a failed accept so a persistent error (fd exhaustion) does
/// not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

struct Running {
    local_addr: SocketAddr,
    stop: Arc<CloseSignal>,
    accept: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// Server instance
pub struct Server {
    ctx: Arc<ServerContext>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Server {
    /// Create a new server instance
    pub fn new(
        config: &Config,
        catalog: HandlerCatalog,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            ctx: ServerContext::new(config, catalog, observer),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Bind the listener and start accepting connections. Returns the bound
    /// address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let config = self.ctx.config();
        let addr = config.listen_addr()?;
        let listener =
            bind(addr, config.backlog).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let stop = Arc::new(CloseSignal::new());
        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.ctx),
            Arc::clone(&stop),
        ));
        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&self.ctx),
            Arc::clone(&stop),
            config.sweep_interval,
        ));

        info!(
            address = %local_addr,
            max_connections = config.max_connections,
            versions = self.ctx.dispatch().catalog().versions().count(),
            "Server listening"
        );
        *running = Some(Running {
            local_addr,
            stop,
            accept,
            sweeper,
        });
        Ok(local_addr)
    }

    /// Stop listening and close every connection. Safe to call repeatedly.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.stop.close();
        for task in [running.accept, running.sweeper] {
            if let Err(e) = task.await {
                error!(error = %e, "Server task ended abnormally");
            }
        }

        let closed = self.ctx.close_all();
        info!(address = %running.local_addr, closed, "Server stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Number of registered connections.
    pub fn client_count(&self) -> usize {
        self.ctx.registry().len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.ctx.registry().snapshot()
    }

    pub fn disconnect(&self, conn: &Arc<Connection>) -> bool {
        self.ctx.disconnect(conn)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats()
    }
}

fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    TcpListener::from_std(socket.into())
}

/// Apply per-socket options from the config.
fn configure(stream: &TcpStream, config: &Config) -> io::Result<()> {
    stream.set_nodelay(config.nodelay)?;
    let socket = SockRef::from(stream);
    socket.set_send_buffer_size(config.socket_send_buffer)?;
    socket.set_recv_buffer_size(config.socket_recv_buffer)?;
    Ok(())
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, stop: Arc<CloseSignal>) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.wait() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = configure(&stream, ctx.config()) {
                    debug!(%peer, error = %e, "Failed to set socket options");
                }
                let (reader, writer) = stream.into_split();
                ctx.attach(Box::new(reader), Box::new(writer), peer);
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("Accept loop stopped");
}

/// Background task for idle and link-dead expiry
async fn sweep_loop(ctx: Arc<ServerContext>, stop: Arc<CloseSignal>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.wait() => break,
            _ = interval.tick() => {
                let report = ctx.sweep();
                if !report.is_empty() {
                    debug!(idle = report.idle, expired = report.expired, "Sweep finished");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PacketIn, PacketOut, PlainEncoding};
    use crate::dispatch::{handler_fn, Requirement, VersionSpec};
    use crate::session::{legacy_hello, NoopObserver, SessionState};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    type Seen = Arc<Mutex<Vec<(u8, SessionState)>>>;

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            pool_buffers: 32,
            ..Config::default()
        }
    }

    /// Version 100 with a recording handler on 0x10 and 0x11, a failing
    /// handler on 0x20 and a panicking one on 0x21.
    fn catalog(seen: Seen) -> HandlerCatalog {
        let mut catalog = HandlerCatalog::new();
        catalog.add_version(VersionSpec::new(100));
        for code in [0x10, 0x11] {
            let seen = seen.clone();
            catalog.register(
                100,
                code,
                Requirement::Handshaken,
                handler_fn(move |conn, packet: &PacketIn| {
                    seen.lock()
                        .unwrap()
                        .push((packet.code(), conn.session().state()));
                    Ok(())
                }),
            );
        }
        catalog
            .register(100, 0x20, Requirement::None, handler_fn(|_, _| Err("bad".into())))
            .register(100, 0x21, Requirement::None, handler_fn(|_, _| panic!("worse")));
        catalog
    }

    fn frame(code: u8) -> Vec<u8> {
        PacketOut::new(code).finish(&PlainEncoding).unwrap().to_vec()
    }

    fn hello(version: u16) -> Vec<u8> {
        legacy_hello(version).finish(&PlainEncoding).unwrap().to_vec()
    }

    async fn start(seen: Seen) -> (Server, SocketAddr) {
        let server = Server::new(&test_config(), catalog(seen), Arc::new(NoopObserver));
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    async fn expect_eof(stream: &mut TcpStream) {
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("server kept the connection open")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_handshake_then_dispatch() {
        let seen: Seen = Default::default();
        let (server, addr) = start(seen.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&[hello(100), frame(0x10)].concat())
            .await
            .unwrap();

        wait_for("dispatch", || !seen.lock().unwrap().is_empty()).await;
        assert_eq!(seen.lock().unwrap()[0], (0x10, SessionState::Connecting));
        assert_eq!(server.client_count(), 1);
        let conn = &server.connections()[0];
        assert_eq!(conn.version(), Some(100));

        server.stop().await;
        expect_eof(&mut client).await;
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_version_disconnects() {
        let seen: Seen = Default::default();
        let (server, addr) = start(seen.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&[hello(150), frame(0x10)].concat())
            .await
            .unwrap();

        expect_eof(&mut client).await;
        wait_for("registry cleanup", || server.client_count() == 0).await;
        assert!(seen.lock().unwrap().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_checksum_failure_disconnects() {
        let seen: Seen = Default::default();
        let (server, addr) = start(seen.clone()).await;

        let mut corrupt = frame(0x11);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&[hello(100), frame(0x10), corrupt, frame(0x10)].concat())
            .await
            .unwrap();

        expect_eof(&mut client).await;
        wait_for("registry cleanup", || server.client_count() == 0).await;
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(0x10, SessionState::Connecting)]);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_stop_dispatch() {
        let seen: Seen = Default::default();
        let (server, addr) = start(seen.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&[hello(100), frame(0x20), frame(0x21), frame(0x11)].concat())
            .await
            .unwrap();

        wait_for("dispatch", || !seen.lock().unwrap().is_empty()).await;
        assert_eq!(seen.lock().unwrap()[0].0, 0x11);
        assert_eq!(server.client_count(), 1);
        assert_eq!(server.stats().handler_faults, 2);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_restartable() {
        let seen: Seen = Default::default();
        let (server, addr) = start(seen).await;
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));
        assert_eq!(server.local_addr().await, Some(addr));

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        wait_for("accepts", || server.client_count() == 2).await;

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running().await);
        assert_eq!(server.client_count(), 0);
        assert!(TcpStream::connect(addr).await.is_err());

        server.start().await.unwrap();
        assert!(server.is_running().await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = Config {
            max_connections: 1,
            ..test_config()
        };
        let server = Server::new(&config, HandlerCatalog::new(), Arc::new(NoopObserver));
        let addr = server.start().await.unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        wait_for("first accept", || server.client_count() == 1).await;
        let mut second = TcpStream::connect(addr).await.unwrap();

        expect_eof(&mut second).await;
        assert_eq!(server.client_count(), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bad_listen_address() {
        let config = Config {
            listen: "nowhere".to_string(),
            ..test_config()
        };
        let server = Server::new(&config, HandlerCatalog::new(), Arc::new(NoopObserver));
        assert!(matches!(server.start().await, Err(ServerError::Config(_))));
    }
}
