//! Wire codec: framing, checksums, packet builders and payload encodings.

mod checksum;
mod encoding;
mod frame;
mod packet;

pub use checksum::{checksum, CHECKSUM_SEED};
pub use encoding::{EncodingKind, PacketEncoding, PlainEncoding, XorEncoding};
pub use frame::{
    decode_frames, frame_len, FrameError, CHECKSUM_SIZE, FRAME_OVERHEAD, HEADER_SIZE,
    LENGTH_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE,
};
pub use packet::{hex_dump, PacketIn, PacketOut};
