//! Frame extraction from an accumulating receive buffer.
//!
//! ```text
//! +---------+------+-----------------+----------+
//! | len u16 | code | payload (len B) | sum u16  |
//! +---------+------+-----------------+----------+
//! ```
//!
//! Both integers are big-endian. The checksum covers every byte before it,
//! with the payload in plaintext.

use super::checksum::checksum;
use super::encoding::PacketEncoding;
use super::packet::PacketIn;
use bytes::Bytes;
use std::ops::ControlFlow;
use thiserror::Error;

/// Size of the big-endian payload length field.
pub const LENGTH_SIZE: usize = 2;
/// Length field plus code byte.
pub const HEADER_SIZE: usize = 3;
/// Trailing checksum.
pub const CHECKSUM_SIZE: usize = 2;
/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CHECKSUM_SIZE;
/// Largest frame clients accept.
pub const MAX_FRAME_SIZE: usize = 2048;
/// Largest payload that fits in [`MAX_FRAME_SIZE`].
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_OVERHEAD;

/// Protocol faults detected while framing. All of them are fatal to the
/// connection; the stream is never resynchronised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error(
        "bad checksum for code 0x{code:02X}: frame carries 0x{received:04X}, \
         computed 0x{computed:04X} (offset {offset}, frame length {frame_len})"
    )]
    Checksum {
        code: u8,
        received: u16,
        computed: u16,
        offset: usize,
        frame_len: usize,
    },

    #[error("frame of {frame_len} bytes can never fit a {capacity} byte receive buffer")]
    Oversized { frame_len: usize, capacity: usize },

    #[error("payload of {payload_len} bytes for code 0x{code:02X} does not fit the length field")]
    PayloadTooLarge { code: u8, payload_len: usize },
}

/// Total frame length announced by the header at the start of `buf`, if the
/// length field is complete.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < LENGTH_SIZE {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]) as usize + FRAME_OVERHEAD)
}

/// Extract every complete frame from `buf[..end]`.
///
/// Each verified packet is passed to `sink`; returning `ControlFlow::Break`
/// stops extraction early. Unconsumed bytes (a partial frame) are moved to
/// the front of `buf` and their count returned so the next read can append
/// after them. On error the buffer contents are unspecified.
pub fn decode_frames<F>(
    buf: &mut [u8],
    end: usize,
    encoding: &dyn PacketEncoding,
    mut sink: F,
) -> Result<usize, FrameError>
where
    F: FnMut(PacketIn) -> ControlFlow<()>,
{
    let capacity = buf.len();
    let mut offset = 0;

    while let Some(frame_len) = frame_len(&buf[offset..end]) {
        if frame_len > capacity {
            return Err(FrameError::Oversized {
                frame_len,
                capacity,
            });
        }
        if end - offset < frame_len {
            break;
        }

        let frame = &mut buf[offset..offset + frame_len];
        let body_end = frame_len - CHECKSUM_SIZE;
        encoding.decrypt(&mut frame[HEADER_SIZE..body_end]);

        let computed = checksum(&frame[..body_end]);
        let received = u16::from_be_bytes([frame[body_end], frame[body_end + 1]]);
        if computed != received {
            return Err(FrameError::Checksum {
                code: frame[LENGTH_SIZE],
                received,
                computed,
                offset,
                frame_len,
            });
        }

        let packet = PacketIn::new(
            frame[LENGTH_SIZE],
            Bytes::copy_from_slice(&frame[HEADER_SIZE..body_end]),
        );
        offset += frame_len;

        if sink(packet).is_break() {
            break;
        }
    }

    let carried = end - offset;
    if offset > 0 && carried > 0 {
        buf.copy_within(offset..end, 0);
    }
    Ok(carried)
}
