//! Process, thread and fork lifecycle
//!
//! The loader constructor performs full initialization from the
//! environment; when the library is linked rather than preloaded, the first
//! hook invocation falls back to the same path ("library-only tracing").
//! Per-thread state is prepared lazily on the first hook in each thread and
//! torn down by the TLS destructor. Fork handlers keep the child's ring
//! self-contained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use ftrace_core::dbg::{self, Domain};
use ftrace_core::msg::{MsgType, TaskInfo};
use ftrace_core::trigger::TriggerTable;
use ftrace_core::{tdbg, tfatal};

use crate::clock;
use crate::rstack::ThreadData;
use crate::session::{self, Session, TraceConfig};
use crate::tls;

static SETUP_DONE: AtomicBool = AtomicBool::new(false);
static FINISHED: AtomicBool = AtomicBool::new(false);
static INIT_ONCE: Once = Once::new();

/// Tracing has been shut down; hooks must be no-ops
#[inline]
pub fn finished() -> bool {
    FINISHED.load(Ordering::Relaxed)
}

#[inline]
pub fn setup_done() -> bool {
    SETUP_DONE.load(Ordering::Acquire)
}

/// Initialize from `FTRACE_*` environment variables with an empty trigger
/// table. Policy expressions from the environment are resolved by the
/// embedding collaborator through `init_with`.
pub fn init_from_env() {
    init_with(TraceConfig::from_env(), TriggerTable::new());
}

/// Initialize with an explicit configuration and pre-built trigger table.
/// Only the first initialization in a process takes effect; the caller must
/// hold the thread's recursion guard if hooks may already fire.
pub fn init_with(config: TraceConfig, triggers: TriggerTable) {
    INIT_ONCE.call_once(move || {
        dbg::init(
            config.debug,
            config.debug_domains.as_deref(),
            config.log_fd,
            config.color,
        );
        tdbg!(Domain::Session, 1, "initializing tracing runtime");

        let explicit_dir = std::env::var_os("FTRACE_DIR").is_some();
        let sess = match Session::new(config, triggers) {
            Ok(sess) => sess,
            Err(e) => tfatal!("{}", e),
        };
        let sess = session::install(sess);

        let task = TaskInfo {
            time: clock::now_ns(),
            pid: sess.pid(),
            tid: clock::tid(),
        };
        sess.pipe().send_session(&task, &sess.sid_bytes(), sess.exe_path());

        // the maps snapshot only matters to a recorder session
        if sess.pipe().is_active() || explicit_dir {
            if let Err(e) = session::record_proc_maps(&sess.config().dir, sess.sid()) {
                tfatal!("cannot write maps file: {}", e);
            }
        }

        unsafe {
            libc::pthread_atfork(Some(atfork_prepare), None, Some(atfork_child));
        }

        SETUP_DONE.store(true, Ordering::Release);
    });
}

/// Prepare per-thread state: stack allocation, shmem ring, TID message.
/// The caller holds the recursion guard (allocations here may recurse into
/// a traced allocator).
pub fn thread_prepare(sess: &Session, mtd: &mut ThreadData) {
    if mtd.prepared {
        return;
    }

    mtd.alloc(sess.config().max_stack, sess.config().depth, sess.enabled());

    if let Err(e) = mtd
        .shmem
        .prepare(sess.sid(), clock::tid(), sess.config().bufsize, sess.pipe())
    {
        tfatal!("cannot prepare shmem buffers: {}", e);
    }

    // timestamp taken after the ring announcement
    let task = TaskInfo {
        time: clock::now_ns(),
        pid: unsafe { libc::getpid() } as u32,
        tid: clock::tid(),
    };
    sess.pipe().send_task(MsgType::Tid, &task);

    tdbg!(Domain::Session, 2, "thread {} prepared", clock::tid());
}

extern "C" fn atfork_prepare() {
    let sess = match session::global() {
        Some(sess) => sess,
        None => return,
    };
    let task = TaskInfo {
        time: clock::now_ns(),
        pid: unsafe { libc::getpid() } as u32,
        tid: 0,
    };
    sess.pipe().send_task(MsgType::ForkStart, &task);
}

extern "C" fn atfork_child() {
    let sess = match session::global() {
        Some(sess) => sess,
        None => return,
    };

    let task = TaskInfo {
        time: clock::now_ns(),
        pid: unsafe { libc::getppid() } as u32,
        tid: unsafe { libc::getpid() } as u32,
    };

    clock::clear_tid_cache();

    let _ = tls::with_mtd(|mtd| {
        mtd.recursion_guard = true;

        // the inherited mappings belong to the parent; never unmap them
        mtd.shmem.discard_inherited();
        if mtd.prepared {
            if let Err(e) = mtd
                .shmem
                .prepare(sess.sid(), clock::tid(), sess.config().bufsize, sess.pipe())
            {
                tfatal!("cannot prepare shmem buffers after fork: {}", e);
            }
        }

        mtd.recursion_guard = false;
    });

    sess.pipe().send_task(MsgType::ForkEnd, &task);
}

/// Drain and shut down. Hooks become no-ops; the hijacked frames of other
/// threads still return correctly through the trampoline.
pub fn fini() {
    if FINISHED.swap(true, Ordering::AcqRel) {
        return;
    }

    let _ = tls::with_mtd(|mtd| {
        mtd.recursion_guard = true;
        if mtd.shmem.is_prepared() {
            if let Some(sess) = session::global() {
                mtd.shmem.finish(sess.pipe());
            }
        }
    });

    if let Some(sess) = session::global() {
        sess.pipe().close();
    }

    tdbg!(Domain::Session, 1, "tracing runtime finished");
}

/// gprof-compatible cleanup entry point
#[no_mangle]
pub extern "C" fn _mcleanup() {
    fini();
}

extern "C" fn runtime_ctor() {
    if setup_done() {
        return;
    }
    let _ = tls::with_mtd(|mtd| mtd.recursion_guard = true);
    init_from_env();
    let _ = tls::with_mtd(|mtd| mtd.recursion_guard = false);
}

/// gprof-compatible startup entry point; the pc range is unused
#[no_mangle]
pub extern "C" fn __monstartup(_lowpc: usize, _highpc: usize) {
    runtime_ctor();
}

extern "C" fn runtime_dtor() {
    fini();
}

#[link_section = ".init_array"]
#[used]
static RUNTIME_CTOR: extern "C" fn() = runtime_ctor;

#[link_section = ".fini_array"]
#[used]
static RUNTIME_DTOR: extern "C" fn() = runtime_dtor;
