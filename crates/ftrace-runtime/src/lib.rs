//! # ftrace-runtime
//!
//! The in-process tracing runtime. It is loaded into the target program
//! (typically via `LD_PRELOAD`) and invoked from compiler-inserted
//! instrumentation on every function entry and return.
//!
//! This crate provides:
//! - Clock and identity (monotonic timestamps, tid, session id)
//! - Control pipe to the recorder process
//! - Per-thread shared-memory buffer ring
//! - Return stack, filter engine and record encoder
//! - Entry/exit dispatch with return-address hijacking
//! - Process/thread/fork lifecycle
//!
//! All work runs on the threads of the traced program; the runtime owns no
//! threads and takes no locks on the hot path.

pub mod clock;
pub mod dispatch;
pub mod filter;
pub mod lifecycle;
pub mod pipe;
pub mod rstack;
pub mod session;
pub mod shmem;
pub mod tls;
pub mod writer;

pub mod arch;

// Re-exports
pub use rstack::{EntryFlags, RStackEntry, ThreadData};
pub use session::{Session, TraceConfig};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // supported
    } else {
        compile_error!("the tracing runtime only supports Linux");
    }
}
