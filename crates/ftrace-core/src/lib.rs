//! # ftrace-core
//!
//! Platform-agnostic types and wire formats for the ftrace tracing runtime.
//!
//! This crate contains no OS-specific code. Everything that touches the
//! kernel (shared memory, pipes, clocks, TLS) lives in `ftrace-runtime`.
//!
//! ## Modules
//!
//! - `record` - framed event records written into shmem segments
//! - `msg` - control messages sent to the recorder over the pipe
//! - `buffer` - shmem segment header layout, flag bits and naming
//! - `trigger` - per-callee policy rules and the trigger table
//! - `filter` - per-thread filter state
//! - `env` - environment variable parsing helpers
//! - `dbg` - leveled, per-domain debug logging
//! - `error` - error types

pub mod buffer;
pub mod dbg;
pub mod env;
pub mod error;
pub mod filter;
pub mod msg;
pub mod record;
pub mod trigger;

// Re-exports for convenience
pub use error::{TraceError, TraceResult};
pub use filter::{FilterResult, FilterState};
pub use msg::MsgType;
pub use record::{Record, RecordType};
pub use trigger::{ArgFmt, ArgSpec, FilterMode, Trigger, TriggerFlags, TriggerTable};

/// Tunables shared by both crates
pub mod constants {
    /// Default size of one shmem segment in bytes
    pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

    /// Default capacity of the per-thread return stack
    pub const DEFAULT_MAX_STACK: usize = 1024;

    /// Default remaining-depth budget applied when a filter matches
    pub const DEFAULT_DEPTH: i32 = 1024;

    /// Size of one argument scratch slot (one per rstack slot).
    /// The leading 4 bytes hold the packed payload length.
    pub const ARGBUF_SIZE: usize = 1024;

    /// Default output directory for the session maps file
    pub const DEFAULT_DIR: &str = "ftrace.dir";
}
