//! Session-state gate checked before a handler runs.

use crate::session::SessionState;
use std::fmt;

/// Minimum session progress a packet code needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Requirement {
    /// Accepted in any state.
    #[default]
    None,
    /// Version handshake done.
    Handshaken,
    /// Logged in: character select or further.
    CharacterSelect,
    /// Entering or inside the world.
    InWorld,
}

impl Requirement {
    pub fn allows(self, state: SessionState) -> bool {
        use SessionState::*;
        match self {
            Requirement::None => true,
            Requirement::Handshaken => state.is_handshaken(),
            Requirement::CharacterSelect => {
                matches!(state, AtCharacterSelect | EnteringWorld | Playing)
            }
            Requirement::InWorld => matches!(state, EnteringWorld | Playing),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-code requirements for one dispatch table.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    requirements: [Requirement; 256],
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            requirements: [Requirement::None; 256],
        }
    }
}

impl Preprocessor {
    pub fn set(&mut self, code: u8, requirement: Requirement) {
        self.requirements[code as usize] = requirement;
    }

    pub fn requirement(&self, code: u8) -> Requirement {
        self.requirements[code as usize]
    }

    pub fn can_process(&self, code: u8, state: SessionState) -> bool {
        self.requirement(code).allows(state)
    }
}
