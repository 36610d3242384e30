//! Inbound and outbound packet types.

use super::checksum::checksum;
use super::encoding::PacketEncoding;
use super::frame::{FrameError, CHECKSUM_SIZE, FRAME_OVERHEAD, HEADER_SIZE, LENGTH_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::{self, Write as _};

/// A verified, decrypted inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    code: u8,
    payload: Bytes,
}

impl PacketIn {
    pub fn new(code: u8, payload: Bytes) -> Self {
        Self { code, payload }
    }

    /// Packet code, used as the dispatch key.
    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// A cheap cursor over the payload for `bytes::Buf` style reads.
    pub fn reader(&self) -> Bytes {
        self.payload.clone()
    }

    /// Size of the frame this packet arrived in.
    pub fn frame_size(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }
}

impl fmt::Display for PacketIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in 0x{:02X} ({} bytes)", self.code, self.payload.len())
    }
}

/// Outbound packet builder.
///
/// The length field and code are written up front; [`PacketOut::finish`]
/// patches the length, appends the checksum and encrypts the payload.
#[derive(Debug, Clone)]
pub struct PacketOut {
    code: u8,
    buf: BytesMut,
}

impl PacketOut {
    pub fn new(code: u8) -> Self {
        Self::with_capacity(code, 64)
    }

    pub fn with_capacity(code: u8, payload_capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(payload_capacity + FRAME_OVERHEAD);
        buf.put_u16(0); // patched in finish()
        buf.put_u8(code);
        Self { code, buf }
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - HEADER_SIZE
    }

    /// Size of the frame once finished.
    pub fn frame_len(&self) -> usize {
        self.buf.len() + CHECKSUM_SIZE
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    /// Length-prefixed (u8) UTF-8 string, truncated to 255 bytes.
    pub fn write_pascal_str(&mut self, value: &str) -> &mut Self {
        let bytes = value.as_bytes();
        let len = bytes.len().min(u8::MAX as usize);
        self.buf.put_u8(len as u8);
        self.buf.put_slice(&bytes[..len]);
        self
    }

    /// Repeat `value` `count` times.
    pub fn fill(&mut self, value: u8, count: usize) -> &mut Self {
        self.buf.put_bytes(value, count);
        self
    }

    /// Produce the wire frame.
    ///
    /// Fails when the payload does not fit the 16-bit length field.
    pub fn finish(mut self, encoding: &dyn PacketEncoding) -> Result<Bytes, FrameError> {
        let payload_len = self.payload_len();
        let Ok(len) = u16::try_from(payload_len) else {
            return Err(FrameError::PayloadTooLarge {
                code: self.code,
                payload_len,
            });
        };

        self.buf[..LENGTH_SIZE].copy_from_slice(&len.to_be_bytes());
        let sum = checksum(&self.buf);
        encoding.encrypt(&mut self.buf[HEADER_SIZE..]);
        self.buf.put_u16(sum);
        Ok(self.buf.freeze())
    }
}

/// Render `data` as a classic 16-bytes-per-line hex dump.
pub fn hex_dump(title: &str, data: &[u8]) -> String {
    let mut out = String::with_capacity(title.len() + data.len() * 4 + 16);
    let _ = writeln!(out, "{title} ({} bytes)", data.len());

    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:04X}: ", line * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02X} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }
    out
}
