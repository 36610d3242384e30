//! Client version detection from the first frame on a connection.
//!
//! Older clients put three decimal digits at frame offsets 12..15; newer
//! ones put major/minor/patch at 11..14 and send a longer frame.

use crate::codec::PacketOut;
use thiserror::Error;

/// Frames shorter than this cannot carry a version.
pub const MIN_HANDSHAKE_LEN: usize = 17;

/// Frames at least this long use the modern layout.
pub const MODERN_HANDSHAKE_LEN: usize = 19;

/// Packet code clients use for the hello frame.
pub const HANDSHAKE_CODE: u8 = 0xF4;

/// Legacy versions at or above this were shipped as 1.1xx.
const LEGACY_REBASE_FROM: u32 = 200;
const LEGACY_REBASE_BY: u32 = 900;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake frame of {0} bytes is too short to carry a version")]
    TooShort(usize),
    #[error("client version {0} is not supported")]
    UnsupportedVersion(u32),
}

/// Extract the client version from a complete first frame (header and
/// checksum included).
pub fn detect_version(frame: &[u8]) -> Result<u32, HandshakeError> {
    if frame.len() < MIN_HANDSHAKE_LEN {
        return Err(HandshakeError::TooShort(frame.len()));
    }

    if frame.len() < MODERN_HANDSHAKE_LEN {
        let version =
            frame[12] as u32 * 100 + frame[13] as u32 * 10 + frame[14] as u32;
        if version >= LEGACY_REBASE_FROM {
            return Ok(version + LEGACY_REBASE_BY);
        }
        return Ok(version);
    }

    Ok(frame[11] as u32 * 1000 + frame[12] as u32 * 100 + frame[13] as u32)
}

/// Hello packet in the legacy 17-byte layout. `version` must be < 1000.
pub fn legacy_hello(version: u16) -> PacketOut {
    let mut packet = PacketOut::new(HANDSHAKE_CODE);
    packet.fill(0, 9);
    packet.write_u8((version / 100 % 10) as u8);
    packet.write_u8((version / 10 % 10) as u8);
    packet.write_u8((version % 10) as u8);
    packet
}

/// Hello packet in the modern layout.
pub fn modern_hello(major: u8, minor: u8, patch: u8) -> PacketOut {
    let mut packet = PacketOut::new(HANDSHAKE_CODE);
    packet.fill(0, 8);
    packet.write_u8(major);
    packet.write_u8(minor);
    packet.write_u8(patch);
    packet.fill(0, 5);
    packet
}
