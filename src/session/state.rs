//! Session state machine.
//!
//! ```text
//! NotConnected -> Connecting -> AtCharacterSelect -> EnteringWorld -> Playing
//!                                                     Playing <-> LinkDead
//! any (except Disconnected) -> Disconnected
//! ```

use super::observer::SessionObserver;
use crate::net::ConnectionId;
use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Protocol state of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    NotConnected = 0,
    Connecting = 1,
    AtCharacterSelect = 2,
    EnteringWorld = 3,
    Playing = 4,
    LinkDead = 5,
    Disconnected = 6,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::NotConnected,
            1 => SessionState::Connecting,
            2 => SessionState::AtCharacterSelect,
            3 => SessionState::EnteringWorld,
            4 => SessionState::Playing,
            5 => SessionState::LinkDead,
            _ => SessionState::Disconnected,
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (NotConnected, Connecting)
                | (Connecting, AtCharacterSelect)
                | (AtCharacterSelect, EnteringWorld)
                | (EnteringWorld, Playing)
                | (Playing, LinkDead)
                | (LinkDead, Playing)
        ) || (next == Disconnected && self != Disconnected)
    }

    /// Link-dead players still count as playing.
    pub fn is_playing(self) -> bool {
        matches!(self, SessionState::Playing | SessionState::LinkDead)
    }

    /// Version handshake done and not yet torn down.
    pub fn is_handshaken(self) -> bool {
        !matches!(self, SessionState::NotConnected | SessionState::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("illegal session transition {from} -> {to}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

/// What the disconnect policy decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The player was in world; the session waits out a grace period.
    LinkDead,
    /// The session is gone.
    TornDown,
}

/// Per-connection session: the state holder plus the ping timestamp used
/// for idle detection.
pub struct Session {
    conn_id: ConnectionId,
    state: AtomicU8,
    /// Unix milliseconds of the last ping (or of entering a refreshing state).
    ping_time: AtomicI64,
    observer: Arc<dyn SessionObserver>,
}

impl Session {
    pub fn new(conn_id: ConnectionId, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            conn_id,
            state: AtomicU8::new(SessionState::NotConnected as u8),
            ping_time: AtomicI64::new(Utc::now().timestamp_millis()),
            observer,
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `to`, returning the previous state.
    ///
    /// Linearizable: concurrent callers racing on the same session see
    /// exactly one winner per transition, and observers hear about each
    /// transition once, synchronously, on the winning caller's thread.
    pub fn transition(&self, to: SessionState) -> Result<SessionState, TransitionError> {
        let mut current = self.state.load(Ordering::Acquire);
        let from = loop {
            let from = SessionState::from_u8(current);
            if !from.can_transition_to(to) {
                return Err(TransitionError { from, to });
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break from,
                Err(actual) => current = actual,
            }
        };

        // refresh ping timeouts when entering the character screen or the world
        if matches!(to, SessionState::Playing | SessionState::AtCharacterSelect) {
            self.touch_ping();
        }

        debug!(conn = %self.conn_id, %from, %to, "Session state changed");
        self.observer.on_state_change(self.conn_id, from, to);
        Ok(from)
    }

    /// Apply the disconnect policy after the transport went away.
    pub fn on_transport_closed(&self) -> DisconnectOutcome {
        if self.transition(SessionState::LinkDead).is_ok() {
            return DisconnectOutcome::LinkDead;
        }
        // already Disconnected is fine, the policy is idempotent
        let _ = self.transition(SessionState::Disconnected);
        DisconnectOutcome::TornDown
    }

    /// Record a keepalive.
    pub fn touch_ping(&self) {
        self.ping_time
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Unix milliseconds of the last ping.
    pub fn ping_time(&self) -> i64 {
        self.ping_time.load(Ordering::Acquire)
    }

    /// Time since the last ping.
    pub fn idle_for(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis() - self.ping_time();
        Duration::from_millis(elapsed.max(0) as u64)
    }

    #[cfg(test)]
    pub(crate) fn backdate_ping(&self, by: Duration) {
        self.ping_time
            .fetch_sub(by.as_millis() as i64, Ordering::AcqRel);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("conn_id", &self.conn_id)
            .field("state", &self.state())
            .finish()
    }
}
