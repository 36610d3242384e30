//! Recent-packet ring used as diagnostic context when a connection fails.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// How many packets (both directions) a connection remembers.
pub const MAX_LAST_PACKETS: usize = 16;

/// Bytes of payload kept per record.
const PREVIEW_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Summary of one packet that crossed the connection.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub direction: Direction,
    pub code: u8,
    pub payload_len: usize,
    pub preview: Vec<u8>,
    pub at: DateTime<Utc>,
}

impl PacketRecord {
    pub fn new(direction: Direction, code: u8, payload: &[u8]) -> Self {
        Self {
            direction,
            code,
            payload_len: payload.len(),
            preview: payload[..payload.len().min(PREVIEW_BYTES)].to_vec(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for PacketRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Inbound => "===>",
            Direction::Outbound => "<===",
        };
        write!(
            f,
            "{} {arrow} 0x{:02X} len={} [",
            self.at.format("%H:%M:%S%.3f"),
            self.code,
            self.payload_len
        )?;
        for (i, b) in self.preview.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02X}")?;
        }
        if self.payload_len > self.preview.len() {
            f.write_str(" ..")?;
        }
        f.write_str("]")
    }
}

/// Bounded FIFO of the last [`MAX_LAST_PACKETS`] packets.
#[derive(Debug, Default)]
pub struct PacketHistory {
    records: Mutex<VecDeque<PacketRecord>>,
}

impl PacketHistory {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(MAX_LAST_PACKETS)),
        }
    }

    pub fn record(&self, record: PacketRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        while records.len() >= MAX_LAST_PACKETS {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Copy of the ring, oldest first.
    pub fn snapshot(&self) -> Vec<PacketRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
