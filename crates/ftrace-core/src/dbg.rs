//! Leveled, per-domain debug logging
//!
//! The runtime logs to a raw file descriptor (default stderr) so that a
//! recorder can redirect diagnostics away from the traced program's output.
//! Verbosity is a global level plus optional per-domain overrides given as a
//! `<D><L><D><L>...` string, e.g. `"S2F1"` for shmem level 2 and filter
//! level 1.
//!
//! # Usage
//!
//! ```ignore
//! use ftrace_core::{tdbg, twarn, tfatal};
//! use ftrace_core::dbg::Domain;
//!
//! tdbg!(Domain::Shmem, 2, "new buffer: [{}] {}", idx, name);
//! twarn!("argument data is too big");
//! tfatal!("cannot open urandom");   // logs, then aborts
//! ```

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

/// Logging domains; each maps to one char of `DOMAIN_CHARS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Domain {
    /// Entry/exit hooks and the return stack
    Trace = 0,
    /// Shmem buffer ring
    Shmem = 1,
    /// Filter and trigger evaluation
    Filter = 2,
    /// Control pipe
    Pipe = 3,
    /// Session setup and teardown
    Session = 4,
}

/// One char per `Domain` discriminant, in order
pub const DOMAIN_CHARS: &str = "TSFPC";

const NR_DOMAINS: usize = 5;

static GLOBAL_LEVEL: AtomicU8 = AtomicU8::new(0);
static DOMAIN_LEVELS: [AtomicU8; NR_DOMAINS] = [
    AtomicU8::new(0),
    AtomicU8::new(0),
    AtomicU8::new(0),
    AtomicU8::new(0),
    AtomicU8::new(0),
];
static LOG_FD: AtomicI32 = AtomicI32::new(2);
static COLOR: AtomicBool = AtomicBool::new(false);

/// Configure logging. `domains` is the `<D><L>...` override string;
/// unknown domain chars are skipped.
pub fn init(level: u8, domains: Option<&str>, log_fd: Option<i32>, color: bool) {
    GLOBAL_LEVEL.store(level, Ordering::Relaxed);
    COLOR.store(color, Ordering::Relaxed);
    if let Some(fd) = log_fd {
        LOG_FD.store(fd, Ordering::Relaxed);
    }
    if let Some(spec) = domains {
        let bytes = spec.as_bytes();
        let mut i = 0;
        while i + 1 < bytes.len() {
            let d = bytes[i] as char;
            let l = bytes[i + 1].wrapping_sub(b'0');
            if let Some(pos) = DOMAIN_CHARS.find(d) {
                if l <= 9 {
                    DOMAIN_LEVELS[pos].store(l, Ordering::Relaxed);
                }
            }
            i += 2;
        }
    }
}

/// Whether a message at `level` in `domain` would be emitted
#[inline]
pub fn enabled(domain: Domain, level: u8) -> bool {
    let global = GLOBAL_LEVEL.load(Ordering::Relaxed);
    let per_domain = DOMAIN_LEVELS[domain as usize].load(Ordering::Relaxed);
    level <= global.max(per_domain)
}

#[doc(hidden)]
pub fn _write_line(tag: &str, tag_color: &str, args: std::fmt::Arguments<'_>) {
    let line = if COLOR.load(Ordering::Relaxed) && !tag_color.is_empty() {
        format!("ftrace: {}{}\x1b[0m {}\n", tag_color, tag, args)
    } else {
        format!("ftrace: {} {}\n", tag, args)
    };
    write_fd(line.as_bytes());
}

#[cfg(unix)]
fn write_fd(bytes: &[u8]) {
    use std::fs::File;
    use std::io::Write;
    use std::mem::ManuallyDrop;
    use std::os::unix::io::FromRawFd;

    let fd = LOG_FD.load(Ordering::Relaxed);
    // Borrow the fd without taking ownership; one write per line.
    let mut f = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    let _ = f.write_all(bytes);
}

#[cfg(not(unix))]
fn write_fd(bytes: &[u8]) {
    use std::io::Write;
    let _ = std::io::stderr().write_all(bytes);
}

/// Domain debug message, emitted when `level` is enabled for the domain
#[macro_export]
macro_rules! tdbg {
    ($domain:expr, $level:expr, $($arg:tt)*) => {{
        if $crate::dbg::enabled($domain, $level) {
            $crate::dbg::_write_line("[DEBUG]", "", format_args!($($arg)*));
        }
    }};
}

/// Warning; always emitted
#[macro_export]
macro_rules! twarn {
    ($($arg:tt)*) => {{
        $crate::dbg::_write_line("[WARN] ", "\x1b[33m", format_args!($($arg)*));
    }};
}

/// Unrecoverable error: log, then abort the process. The traced program
/// must never observe an unwinding runtime.
#[macro_export]
macro_rules! tfatal {
    ($($arg:tt)*) => {{
        $crate::dbg::_write_line("[FATAL]", "\x1b[31m", format_args!($($arg)*));
        ::std::process::abort()
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_chars_cover_domains() {
        assert_eq!(DOMAIN_CHARS.len(), NR_DOMAINS);
        assert_eq!(DOMAIN_CHARS.find('S'), Some(Domain::Shmem as usize));
        assert_eq!(DOMAIN_CHARS.find('C'), Some(Domain::Session as usize));
    }

    #[test]
    fn test_domain_override() {
        init(0, Some("S2"), None, false);
        assert!(enabled(Domain::Shmem, 2));
        assert!(!enabled(Domain::Shmem, 3));
        assert!(!enabled(Domain::Filter, 1));
        init(0, Some("S0"), None, false);
    }

    #[test]
    fn test_bad_domain_spec_skipped() {
        // Unknown domain chars and out-of-range levels must not panic
        init(0, Some("Zz9XS"), None, false);
    }
}
