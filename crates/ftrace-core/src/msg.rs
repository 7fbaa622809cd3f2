//! Control messages to the recorder
//!
//! Messages are framed as `{ magic: u32, type: u32, len: u32 }` followed by
//! `len` payload bytes and are written to the pipe with one gathered write.

/// Frame magic, first field of every message
pub const MSG_MAGIC: u32 = 0xF700_F700;

/// Size of the frame header
pub const MSG_HDR_SIZE: usize = 12;

/// Fixed part of the SESSION payload (task info + sid + namelen)
pub const SESSION_PAYLOAD_SIZE: usize = TASK_PAYLOAD_SIZE + 16 + 4;

/// Size of a TID / FORK_START / FORK_END payload
pub const TASK_PAYLOAD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    RecStart = 1,
    RecEnd = 2,
    Tid = 3,
    ForkStart = 4,
    ForkEnd = 5,
    Session = 6,
    Lost = 7,
}

/// Encode a frame header for a message of `len` payload bytes
pub fn encode_header(mtype: MsgType, len: u32) -> [u8; MSG_HDR_SIZE] {
    let mut hdr = [0u8; MSG_HDR_SIZE];
    hdr[0..4].copy_from_slice(&MSG_MAGIC.to_le_bytes());
    hdr[4..8].copy_from_slice(&(mtype as u32).to_le_bytes());
    hdr[8..12].copy_from_slice(&len.to_le_bytes());
    hdr
}

/// Task identity payload, used by TID and the FORK pair
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskInfo {
    pub time: u64,
    pub pid: u32,
    pub tid: u32,
}

impl TaskInfo {
    pub fn encode(&self) -> [u8; TASK_PAYLOAD_SIZE] {
        let mut buf = [0u8; TASK_PAYLOAD_SIZE];
        buf[0..8].copy_from_slice(&self.time.to_le_bytes());
        buf[8..12].copy_from_slice(&self.pid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.tid.to_le_bytes());
        buf
    }
}

/// Fixed prefix of the SESSION payload; the exe name bytes follow it
/// in a separate iovec.
pub fn encode_session(task: &TaskInfo, sid: &[u8; 16], namelen: u32) -> [u8; SESSION_PAYLOAD_SIZE] {
    let mut buf = [0u8; SESSION_PAYLOAD_SIZE];
    buf[0..16].copy_from_slice(&task.encode());
    buf[16..32].copy_from_slice(sid);
    buf[32..36].copy_from_slice(&namelen.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let hdr = encode_header(MsgType::RecStart, 5);
        assert_eq!(&hdr[0..4], &MSG_MAGIC.to_le_bytes());
        assert_eq!(u32::from_le_bytes(hdr[4..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(hdr[8..12].try_into().unwrap()), 5);
    }

    #[test]
    fn test_msg_type_values() {
        assert_eq!(MsgType::RecStart as u32, 1);
        assert_eq!(MsgType::RecEnd as u32, 2);
        assert_eq!(MsgType::Tid as u32, 3);
        assert_eq!(MsgType::ForkStart as u32, 4);
        assert_eq!(MsgType::ForkEnd as u32, 5);
        assert_eq!(MsgType::Session as u32, 6);
        assert_eq!(MsgType::Lost as u32, 7);
    }

    #[test]
    fn test_task_payload() {
        let task = TaskInfo { time: 99, pid: 10, tid: 20 };
        let buf = task.encode();
        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), 99);
        assert_eq!(u32::from_le_bytes(buf[8..12].try_into().unwrap()), 10);
        assert_eq!(u32::from_le_bytes(buf[12..16].try_into().unwrap()), 20);
    }

    #[test]
    fn test_session_payload() {
        let task = TaskInfo { time: 1, pid: 2, tid: 3 };
        let sid = *b"0123456789abcdef";
        let buf = encode_session(&task, &sid, 7);
        assert_eq!(&buf[16..32], &sid);
        assert_eq!(u32::from_le_bytes(buf[32..36].try_into().unwrap()), 7);
        assert_eq!(buf.len(), 36);
    }
}
