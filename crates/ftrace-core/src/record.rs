//! Framed event records
//!
//! Each recorded call produces one ENTRY and at most one EXIT record in the
//! per-thread shmem segment; a LOST record carries the count of events
//! dropped since the previous successful emission and only ever appears at
//! the head of a segment.
//!
//! Layout (little-endian, 8-byte aligned):
//! ```text
//! 0x00: time   (u64) - ENTRY: start time, EXIT: end time, LOST: 0
//! 0x08: type   (u16) - ENTRY=0, EXIT=1, LOST=2
//! 0x0a: unused (u8)  - sentinel, always 0x0a
//! 0x0b: more   (u8)  - 1 if an argument/retval payload follows
//! 0x0c: depth  (u16) - recorded depth
//! 0x0e: pad    (u16) - zero
//! 0x10: addr   (u64) - callee address, or dropped count for LOST
//! ```
//!
//! When `more` is set, the payload bytes packed in the thread's argbuf slot
//! follow immediately, padded to 8-byte alignment. The slot's 32-bit length
//! header is never written to the stream.

/// Size of the fixed record header
pub const RECORD_SIZE: usize = 24;

/// Value of the `unused` sentinel byte
pub const RECORD_UNUSED: u8 = 0x0a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RecordType {
    Entry = 0,
    Exit = 1,
    Lost = 2,
}

impl RecordType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(RecordType::Entry),
            1 => Some(RecordType::Exit),
            2 => Some(RecordType::Lost),
            _ => None,
        }
    }
}

/// One decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub time: u64,
    pub rtype: RecordType,
    pub more: bool,
    pub depth: u16,
    pub addr: u64,
}

impl Record {
    /// Synthetic record placed at the head of a segment after drops
    pub fn lost(count: u64) -> Self {
        Record {
            time: 0,
            rtype: RecordType::Lost,
            more: false,
            depth: 0,
            addr: count,
        }
    }

    /// Encode into `out`, which must hold at least `RECORD_SIZE` bytes
    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.time.to_le_bytes());
        out[8..10].copy_from_slice(&(self.rtype as u16).to_le_bytes());
        out[10] = RECORD_UNUSED;
        out[11] = self.more as u8;
        out[12..14].copy_from_slice(&self.depth.to_le_bytes());
        out[14..16].copy_from_slice(&0u16.to_le_bytes());
        out[16..24].copy_from_slice(&self.addr.to_le_bytes());
    }

    /// Decode a record header from the front of `buf`
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_SIZE {
            return None;
        }
        let rtype = RecordType::from_u16(u16::from_le_bytes([buf[8], buf[9]]))?;
        Some(Record {
            time: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            rtype,
            more: buf[11] != 0,
            depth: u16::from_le_bytes([buf[12], buf[13]]),
            addr: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }
}

/// Round `n` up to a multiple of `align` (power of two)
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
