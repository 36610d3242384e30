//! Client sessions.
//!
//! The version handshake, the per-connection state machine and the
//! lifecycle callbacks other subsystems observe it through.

mod handshake;
mod observer;
mod state;

pub use handshake::{
    detect_version, legacy_hello, modern_hello, HandshakeError, HANDSHAKE_CODE,
    MIN_HANDSHAKE_LEN, MODERN_HANDSHAKE_LEN,
};
pub use observer::{AuditLog, NoopObserver, ObserverSet, SessionObserver};
pub use state::{DisconnectOutcome, Session, SessionState, TransitionError};
