//! Echo handler, for I/O throughput testing.

use crate::codec::{PacketIn, PacketOut};
use crate::dispatch::{HandlerResult, PacketHandler};
use crate::net::Connection;
use std::sync::Arc;

/// Send the packet straight back under the same code.
pub struct EchoHandler;

impl PacketHandler for EchoHandler {
    fn handle(&self, conn: &Arc<Connection>, packet: &PacketIn) -> HandlerResult {
        let mut reply = PacketOut::with_capacity(packet.code(), packet.payload().len());
        reply.write_bytes(packet.payload());
        conn.send(reply)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}
