//! Keepalive handler.

use super::codes;
use crate::codec::{PacketIn, PacketOut};
use crate::dispatch::{HandlerResult, PacketHandler};
use crate::net::Connection;
use std::sync::Arc;

/// Refresh the session's ping time and answer with a pong carrying the
/// client's payload (usually its timestamp) back.
///
/// No game state involved; also used for latency checks.
pub struct PingHandler;

impl PacketHandler for PingHandler {
    fn handle(&self, conn: &Arc<Connection>, packet: &PacketIn) -> HandlerResult {
        conn.session().touch_ping();

        let mut pong = PacketOut::with_capacity(codes::PONG, packet.payload().len());
        pong.write_bytes(packet.payload());
        conn.send(pong)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ping"
    }
}
