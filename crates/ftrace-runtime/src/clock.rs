//! Clock and identity
//!
//! Monotonic nanosecond timestamps, the per-thread OS thread id, and the
//! process-wide random session id.

use std::cell::Cell;
use std::io::Read;
use std::sync::OnceLock;

use ftrace_core::error::{ResourceError, TraceResult};
use ftrace_core::tfatal;

/// Monotonic clock reading in nanoseconds
#[inline]
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

thread_local! {
    /// Cached OS thread id; 0 means not yet read
    static TID: Cell<u32> = const { Cell::new(0) };
}

/// The OS thread id of the calling thread, cached after the first syscall
#[inline]
pub fn tid() -> u32 {
    TID.with(|cell| {
        let mut t = cell.get();
        if t == 0 {
            t = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
            cell.set(t);
        }
        t
    })
}

/// Drop the cached tid; the fork child must re-read its own
pub fn clear_tid_cache() {
    let _ = TID.try_with(|cell| cell.set(0));
}

static SESSION_ID: OnceLock<String> = OnceLock::new();

/// Read 8 bytes from the OS entropy source and format 16 hex digits
pub fn gen_session_id() -> TraceResult<String> {
    let mut bytes = [0u8; 8];
    std::fs::File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut bytes))
        .map_err(|_| ResourceError::Entropy)?;
    Ok(format!("{:016x}", u64::from_le_bytes(bytes)))
}

/// The process session id, stable for the life of the process.
/// Failure to read entropy on first use is fatal.
pub fn session_id() -> &'static str {
    SESSION_ID.get_or_init(|| match gen_session_id() {
        Ok(id) => id,
        Err(e) => tfatal!("cannot generate session id: {}", e),
    })
}
