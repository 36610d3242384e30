//! Packet handler interface.

use crate::codec::PacketIn;
use crate::net::Connection;
use std::error::Error;
use std::sync::Arc;

/// Result of running a handler. Errors are logged and counted; they never
/// close the connection on their own.
pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Processes one packet code for one protocol version.
///
/// Handlers run synchronously on the receive task of the connection that
/// produced the packet, so packets of a single connection are handled in
/// arrival order. A handler that needs to wait on something should spawn.
pub trait PacketHandler: Send + Sync {
    fn handle(&self, conn: &Arc<Connection>, packet: &PacketIn) -> HandlerResult;

    /// Name used in slow-handler and fault logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Closures make quick handlers, mostly in tests.
impl<F> PacketHandler for F
where
    F: Fn(&Arc<Connection>, &PacketIn) -> HandlerResult + Send + Sync,
{
    fn handle(&self, conn: &Arc<Connection>, packet: &PacketIn) -> HandlerResult {
        self(conn, packet)
    }

    fn name(&self) -> &'static str {
        "closure"
    }
}

/// Pin a closure to the handler signature so its argument lifetimes are
/// inferred as higher-ranked.
pub fn handler_fn<F>(f: F) -> F
where
    F: Fn(&Arc<Connection>, &PacketIn) -> HandlerResult + Send + Sync,
{
    f
}
