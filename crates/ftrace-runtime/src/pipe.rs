//! Control pipe to the recorder
//!
//! The recorder pre-opens a FIFO and passes its fd through the environment.
//! Every message is framed (`ftrace_core::msg`) and written with a single
//! gathered `writev`, so frames never interleave across threads. Without a
//! valid fd all sends are silently dropped, which keeps standalone runs
//! working. A short or failed write is fatal: the recorder is gone and the
//! stream can no longer be trusted.

use std::sync::atomic::{AtomicI32, Ordering};

use ftrace_core::dbg::Domain;
use ftrace_core::msg::{self, MsgType, TaskInfo};
use ftrace_core::{tdbg, tfatal};

/// Wrapper around the optional recorder fd
pub struct ControlPipe {
    fd: AtomicI32,
}

impl ControlPipe {
    /// A pipe that drops everything
    pub fn disabled() -> Self {
        ControlPipe { fd: AtomicI32::new(-1) }
    }

    /// Adopt an inherited fd. Anything that is not a FIFO is rejected and
    /// the pipe is disabled (control messages off, recording continues).
    pub fn from_fd(fd: i32) -> Self {
        if fd < 0 || !is_fifo(fd) {
            tdbg!(Domain::Pipe, 1, "ignore invalid pipe fd: {}", fd);
            return ControlPipe::disabled();
        }
        ControlPipe { fd: AtomicI32::new(fd) }
    }

    pub fn is_active(&self) -> bool {
        self.fd.load(Ordering::Relaxed) >= 0
    }

    /// Close the fd and disable further sends
    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::Relaxed);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }

    fn send_iov(&self, iov: &[libc::iovec], total: usize) {
        let fd = self.fd.load(Ordering::Relaxed);
        if fd < 0 {
            return;
        }

        let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as i32) };
        if n != total as isize {
            tfatal!("control pipe write failed: {} of {} bytes", n, total);
        }
    }

    /// Send one framed message
    pub fn send(&self, mtype: MsgType, payload: &[u8]) {
        if !self.is_active() {
            return;
        }
        let hdr = msg::encode_header(mtype, payload.len() as u32);
        let iov = [
            libc::iovec {
                iov_base: hdr.as_ptr() as *mut libc::c_void,
                iov_len: hdr.len(),
            },
            libc::iovec {
                iov_base: payload.as_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            },
        ];
        self.send_iov(&iov, hdr.len() + payload.len());
    }

    /// SESSION message: fixed payload prefix plus the exe name bytes
    pub fn send_session(&self, task: &TaskInfo, sid: &[u8; 16], name: &str) {
        if !self.is_active() {
            return;
        }
        let hdr = msg::encode_header(
            MsgType::Session,
            (msg::SESSION_PAYLOAD_SIZE + name.len()) as u32,
        );
        let prefix = msg::encode_session(task, sid, name.len() as u32);
        let iov = [
            libc::iovec {
                iov_base: hdr.as_ptr() as *mut libc::c_void,
                iov_len: hdr.len(),
            },
            libc::iovec {
                iov_base: prefix.as_ptr() as *mut libc::c_void,
                iov_len: prefix.len(),
            },
            libc::iovec {
                iov_base: name.as_ptr() as *mut libc::c_void,
                iov_len: name.len(),
            },
        ];
        self.send_iov(&iov, hdr.len() + prefix.len() + name.len());
    }

    pub fn send_task(&self, mtype: MsgType, task: &TaskInfo) {
        self.send(mtype, &task.encode());
    }

    pub fn send_rec_start(&self, segment: &str) {
        self.send(MsgType::RecStart, segment.as_bytes());
    }

    pub fn send_rec_end(&self, segment: &str) {
        self.send(MsgType::RecEnd, segment.as_bytes());
    }

    pub fn send_lost(&self, count: u32) {
        self.send(MsgType::Lost, &count.to_le_bytes());
    }
}

fn is_fifo(fd: i32) -> bool {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return false;
    }
    (st.st_mode & libc::S_IFMT) == libc::S_IFIFO
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::{AsRawFd, IntoRawFd};

    fn make_pipe() -> (std::fs::File, ControlPipe) {
        let (rd, wr) = nix::unistd::pipe().unwrap();
        let reader = std::fs::File::from(rd);
        (reader, ControlPipe::from_fd(wr.into_raw_fd()))
    }

    #[test]
    fn test_invalid_fd_disables() {
        let pipe = ControlPipe::from_fd(-1);
        assert!(!pipe.is_active());
        // sends on a disabled pipe are silently dropped
        pipe.send_lost(3);
    }

    #[test]
    fn test_non_fifo_rejected() {
        let file = tempfile::tempfile().unwrap();
        let pipe = ControlPipe::from_fd(file.as_raw_fd());
        assert!(!pipe.is_active());
    }

    #[test]
    fn test_framing() {
        let (mut reader, pipe) = make_pipe();
        assert!(pipe.is_active());

        pipe.send_rec_start("/ftrace-ab-1-000");
        pipe.close();

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();

        assert_eq!(&buf[0..4], &msg::MSG_MAGIC.to_le_bytes());
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), MsgType::RecStart as u32);
        let len = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        assert_eq!(&buf[12..12 + len], b"/ftrace-ab-1-000");
        assert_eq!(buf.len(), 12 + len);
    }

    #[test]
    fn test_session_frame() {
        let (mut reader, pipe) = make_pipe();
        let task = TaskInfo { time: 5, pid: 100, tid: 100 };
        let sid = *b"00c0ffee00c0ffee";

        pipe.send_session(&task, &sid, "a.out");
        pipe.close();

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();

        let len = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        assert_eq!(len, msg::SESSION_PAYLOAD_SIZE + 5);
        assert_eq!(&buf[12 + 16..12 + 32], &sid);
        assert_eq!(&buf[buf.len() - 5..], b"a.out");
    }

    #[test]
    fn test_lost_payload() {
        let (mut reader, pipe) = make_pipe();
        pipe.send_lost(41);
        pipe.close();

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf[12..16].try_into().unwrap()), 41);
    }
}
