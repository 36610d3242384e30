//! Built-in handler set.
//!
//! Enough protocol to exercise the transport end to end: a hello/version
//! acknowledgement, keepalives, echo, the walk into the world and a clean
//! quit. Game logic lives in other providers.

mod echo;
mod ping;
mod session;

pub use echo::EchoHandler;
pub use ping::PingHandler;
pub use session::{EnterWorldHandler, HelloHandler, QuitHandler, WorldReadyHandler};

use crate::codec::EncodingKind;
use crate::dispatch::{HandlerCatalog, HandlerProvider, Requirement, VersionSpec};

/// Packet codes used by the built-in handlers.
pub mod codes {
    use crate::session::HANDSHAKE_CODE;

    // client -> server
    pub const HELLO: u8 = HANDSHAKE_CODE;
    pub const PING: u8 = 0xA3;
    pub const ECHO: u8 = 0x50;
    pub const ENTER_WORLD: u8 = 0x10;
    pub const WORLD_READY: u8 = 0x11;
    pub const QUIT: u8 = 0xA1;

    // server -> client
    pub const PONG: u8 = 0x29;
    pub const VERSION_ACK: u8 = 0x2A;
    pub const STATE_REPORT: u8 = 0x2B;
    pub const GOODBYE: u8 = 0x2D;
}

/// Oldest supported client.
pub const LEGACY_VERSION: u32 = 100;
/// Current client; inherits everything from the legacy one.
pub const MODERN_VERSION: u32 = 1115;

/// Registers the built-in handlers for both supported versions.
#[derive(Debug, Default, Clone)]
pub struct BuiltinHandlers {
    /// Encoding negotiated by [`MODERN_VERSION`] clients.
    pub modern_encoding: EncodingKind,
}

impl BuiltinHandlers {
    pub fn new(modern_encoding: EncodingKind) -> Self {
        Self { modern_encoding }
    }
}

impl HandlerProvider for BuiltinHandlers {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn register(&self, catalog: &mut HandlerCatalog) {
        catalog
            .add_version(VersionSpec::new(LEGACY_VERSION))
            .add_version(
                VersionSpec::new(MODERN_VERSION)
                    .inherits(LEGACY_VERSION)
                    .encoding(self.modern_encoding.clone()),
            )
            .register(LEGACY_VERSION, codes::HELLO, Requirement::Handshaken, HelloHandler)
            .register(LEGACY_VERSION, codes::PING, Requirement::Handshaken, PingHandler)
            .register(LEGACY_VERSION, codes::ECHO, Requirement::None, EchoHandler)
            .register(
                LEGACY_VERSION,
                codes::ENTER_WORLD,
                Requirement::CharacterSelect,
                EnterWorldHandler,
            )
            .register(
                LEGACY_VERSION,
                codes::WORLD_READY,
                Requirement::InWorld,
                WorldReadyHandler,
            )
            .register(LEGACY_VERSION, codes::QUIT, Requirement::None, QuitHandler);
    }
}
