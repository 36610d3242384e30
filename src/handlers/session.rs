//! Handlers that walk a session from hello to in-world, and out again.

use super::codes;
use crate::codec::{PacketIn, PacketOut};
use crate::dispatch::{HandlerResult, PacketHandler};
use crate::net::Connection;
use crate::session::SessionState;
use std::sync::Arc;
use tracing::debug;

const SERVER_NAME: &str = "realm-gate";

fn report_state(conn: &Connection) -> HandlerResult {
    let mut report = PacketOut::new(codes::STATE_REPORT);
    report.write_u8(conn.session().state() as u8);
    conn.send(report)?;
    Ok(())
}

/// Answers the hello frame: acknowledges the negotiated version and moves
/// the session to character select.
pub struct HelloHandler;

impl PacketHandler for HelloHandler {
    fn handle(&self, conn: &Arc<Connection>, _packet: &PacketIn) -> HandlerResult {
        conn.session().transition(SessionState::AtCharacterSelect)?;

        let mut ack = PacketOut::new(codes::VERSION_ACK);
        ack.write_u32(conn.version().unwrap_or_default())
            .write_pascal_str(SERVER_NAME);
        conn.send(ack)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "hello"
    }
}

/// Character chosen; the client starts loading the world.
pub struct EnterWorldHandler;

impl PacketHandler for EnterWorldHandler {
    fn handle(&self, conn: &Arc<Connection>, _packet: &PacketIn) -> HandlerResult {
        conn.session().transition(SessionState::EnteringWorld)?;
        report_state(conn)
    }

    fn name(&self) -> &'static str {
        "enter-world"
    }
}

/// World loaded on the client; the player is now in play.
pub struct WorldReadyHandler;

impl PacketHandler for WorldReadyHandler {
    fn handle(&self, conn: &Arc<Connection>, _packet: &PacketIn) -> HandlerResult {
        conn.session().transition(SessionState::Playing)?;
        report_state(conn)
    }

    fn name(&self) -> &'static str {
        "world-ready"
    }
}

/// Say goodbye, flush, then close.
pub struct QuitHandler;

impl PacketHandler for QuitHandler {
    fn handle(&self, conn: &Arc<Connection>, _packet: &PacketIn) -> HandlerResult {
        debug!(conn = %conn.id(), "Client asked to quit");
        // a deliberate quit never leaves a link-dead body behind
        let _ = conn.session().transition(SessionState::Disconnected);
        conn.send(PacketOut::new(codes::GOODBYE))?;
        conn.close_after_flush();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "quit"
    }
}
