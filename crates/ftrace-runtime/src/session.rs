//! Session and configuration
//!
//! Configuration comes from `FTRACE_*` environment variables with
//! compile-time defaults; the `Session` bundles everything the engine reads
//! per call. Engine functions take `&Session` so tests can run against
//! private sessions; the preload path installs one process-wide session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use ftrace_core::buffer::BUF_HDR_SIZE;
use ftrace_core::constants::{
    ARGBUF_SIZE, DEFAULT_BUFFER_SIZE, DEFAULT_DEPTH, DEFAULT_DIR, DEFAULT_MAX_STACK,
};
use ftrace_core::env::{env_flag, env_get, env_get_opt, env_get_str};
use ftrace_core::error::{TraceError, TraceResult};
use ftrace_core::record::RECORD_SIZE;
use ftrace_core::trigger::{FilterMode, TriggerTable};

use crate::clock;
use crate::pipe::ControlPipe;

/// Runtime configuration with builder-style overrides.
///
/// Environment variables (all optional):
/// - `FTRACE_PIPE` - recorder fd, must be a FIFO
/// - `FTRACE_LOGFD` - fd for diagnostics (default stderr)
/// - `FTRACE_DEBUG` - global debug level
/// - `FTRACE_DEBUG_DOMAIN` - per-domain levels, `<D><L>...`
/// - `FTRACE_DIR` - output directory for the maps file
/// - `FTRACE_BUFFER` - shmem segment size in bytes
/// - `FTRACE_MAX_STACK` - return stack capacity
/// - `FTRACE_THRESHOLD` - minimum call duration to record, in ns
/// - `FTRACE_COLOR` - colored diagnostics
/// - `FTRACE_DEMANGLE` - symbol demangling for collaborators
/// - `FTRACE_FILTER` / `FTRACE_TRIGGER` / `FTRACE_ARGUMENT` /
///   `FTRACE_RETVAL` - policy expressions, resolved by the collaborator
///   that builds the trigger table
/// - `FTRACE_DEPTH` - default filter depth
/// - `FTRACE_DISABLED` - start with tracing off
/// - `FTRACE_PLTHOOK` - hook PLT entries (collaborator)
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub bufsize: usize,
    pub max_stack: usize,
    pub threshold_ns: u64,
    pub depth: i32,
    pub filter_mode: FilterMode,
    pub dir: String,
    pub pipe_fd: Option<i32>,
    pub log_fd: Option<i32>,
    pub debug: u8,
    pub debug_domains: Option<String>,
    pub color: bool,
    pub demangle: bool,
    pub disabled: bool,
    pub plthook: bool,
    pub filter_expr: Option<String>,
    pub trigger_expr: Option<String>,
    pub argument_expr: Option<String>,
    pub retval_expr: Option<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceConfig {
    /// Compile-time defaults, no environment lookups
    pub fn new() -> Self {
        TraceConfig {
            bufsize: DEFAULT_BUFFER_SIZE,
            max_stack: DEFAULT_MAX_STACK,
            threshold_ns: 0,
            depth: DEFAULT_DEPTH,
            filter_mode: FilterMode::None,
            dir: DEFAULT_DIR.to_string(),
            pipe_fd: None,
            log_fd: None,
            debug: 0,
            debug_domains: None,
            color: false,
            demangle: true,
            disabled: false,
            plthook: false,
            filter_expr: None,
            trigger_expr: None,
            argument_expr: None,
            retval_expr: None,
        }
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        TraceConfig {
            bufsize: env_get("FTRACE_BUFFER", DEFAULT_BUFFER_SIZE),
            max_stack: env_get("FTRACE_MAX_STACK", DEFAULT_MAX_STACK),
            threshold_ns: env_get("FTRACE_THRESHOLD", 0),
            depth: env_get("FTRACE_DEPTH", DEFAULT_DEPTH),
            filter_mode: FilterMode::None,
            dir: env_get_str("FTRACE_DIR").unwrap_or_else(|| DEFAULT_DIR.to_string()),
            pipe_fd: env_get_opt("FTRACE_PIPE"),
            log_fd: env_get_opt("FTRACE_LOGFD"),
            debug: env_get("FTRACE_DEBUG", 0),
            debug_domains: env_get_str("FTRACE_DEBUG_DOMAIN"),
            color: env_get("FTRACE_COLOR", 0u8) != 0,
            demangle: env_get("FTRACE_DEMANGLE", 1u8) != 0,
            disabled: env_flag("FTRACE_DISABLED"),
            plthook: env_flag("FTRACE_PLTHOOK"),
            filter_expr: env_get_str("FTRACE_FILTER"),
            trigger_expr: env_get_str("FTRACE_TRIGGER"),
            argument_expr: env_get_str("FTRACE_ARGUMENT"),
            retval_expr: env_get_str("FTRACE_RETVAL"),
        }
    }

    // Builder methods

    pub fn bufsize(mut self, n: usize) -> Self {
        self.bufsize = n;
        self
    }

    pub fn max_stack(mut self, n: usize) -> Self {
        self.max_stack = n;
        self
    }

    pub fn threshold_ns(mut self, ns: u64) -> Self {
        self.threshold_ns = ns;
        self
    }

    pub fn depth(mut self, depth: i32) -> Self {
        self.depth = depth;
        self
    }

    pub fn filter_mode(mut self, mode: FilterMode) -> Self {
        self.filter_mode = mode;
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn dir(mut self, dir: &str) -> Self {
        self.dir = dir.to_string();
        self
    }

    pub fn validate(&self) -> TraceResult<()> {
        // a segment must fit a LOST record plus one full record with payload
        if self.bufsize < BUF_HDR_SIZE + 2 * RECORD_SIZE + ARGBUF_SIZE {
            return Err(TraceError::Config("buffer size too small"));
        }
        if self.max_stack == 0 || self.max_stack > u16::MAX as usize {
            return Err(TraceError::Config("bad max stack depth"));
        }
        if self.depth <= 0 {
            return Err(TraceError::Config("filter depth must be positive"));
        }
        Ok(())
    }
}

/// Process-wide tracing state
pub struct Session {
    config: TraceConfig,
    sid: String,
    exe_path: String,
    pid: u32,
    pipe: ControlPipe,
    triggers: TriggerTable,
    enabled: AtomicBool,
}

impl Session {
    /// Build a session using the process session id
    pub fn new(config: TraceConfig, triggers: TriggerTable) -> TraceResult<Session> {
        Session::with_id(config, triggers, clock::session_id().to_string())
    }

    /// Build a session with an explicit id. Tests use fresh ids so their
    /// segment names stay apart.
    pub fn with_id(config: TraceConfig, triggers: TriggerTable, sid: String) -> TraceResult<Session> {
        config.validate()?;

        let exe_path = std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|_| TraceError::Config("cannot read exe path"))?;

        let pipe = match config.pipe_fd {
            Some(fd) => ControlPipe::from_fd(fd),
            None => ControlPipe::disabled(),
        };

        let enabled = !config.disabled;
        Ok(Session {
            config,
            sid,
            exe_path,
            pid: unsafe { libc::getpid() } as u32,
            pipe,
            triggers,
            enabled: AtomicBool::new(enabled),
        })
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// The 16 ascii hex digits of the session id
    pub fn sid_bytes(&self) -> [u8; 16] {
        let mut out = [b'0'; 16];
        let bytes = self.sid.as_bytes();
        let n = bytes.len().min(16);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }

    pub fn exe_path(&self) -> &str {
        &self.exe_path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pipe(&self) -> &ControlPipe {
        &self.pipe
    }

    pub fn triggers(&self) -> &TriggerTable {
        &self.triggers
    }

    /// Process-wide trace switch, flipped by TRACE_ON/TRACE_OFF triggers.
    /// Plain load; readers tolerate stale values.
    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }
}

static SESSION: OnceLock<Session> = OnceLock::new();

/// The installed process-wide session, if any
#[inline]
pub fn global() -> Option<&'static Session> {
    SESSION.get()
}

/// Install the process-wide session; the first caller wins
pub fn install(sess: Session) -> &'static Session {
    SESSION.get_or_init(|| sess)
}

/// Copy `/proc/self/maps` verbatim to `<dir>/sid-<sid>.map`
pub fn record_proc_maps(dir: &str, sid: &str) -> std::io::Result<PathBuf> {
    let maps = std::fs::read("/proc/self/maps")?;
    std::fs::create_dir_all(dir)?;

    let path = PathBuf::from(dir).join(format!("sid-{}.map", sid));
    std::fs::write(&path, maps)?;
    Ok(path)
}
