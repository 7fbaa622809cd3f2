//! Entry/exit dispatch
//!
//! Two instrumentation styles share the filter and record path:
//!
//! - mcount-style: the entry hook hijacks the caller's return-address slot
//!   so the callee's `ret` lands in the trampoline, which calls
//!   `ftrace_exit` to pop the frame and recover the real address. A
//!   filtered-out call is not hijacked and produces no exit.
//! - cyg_profile-style: enter/exit hooks come in pairs, so a frame is
//!   pushed even for filtered-out calls (marked NORECORD) to keep the pops
//!   balanced.
//!
//! Reentrancy from the runtime itself (e.g. a traced `malloc` called while
//! allocating thread state) is cut off by the per-thread recursion guard.

use std::sync::atomic::{compiler_fence, Ordering};

use ftrace_core::filter::FilterResult;

use crate::arch::{self, Regs};
use crate::clock;
use crate::filter;
use crate::lifecycle;
use crate::rstack::{EntryFlags, RStackEntry, ThreadData, INVALID_DYN_IDX};
use crate::session::{self, Session};
use crate::tls;

/// mcount-style entry. Returns -1 when the call is not tracked.
pub fn mcount_entry_impl(
    sess: &Session,
    mtd: &mut ThreadData,
    parent_loc: *mut usize,
    child_ip: usize,
    regs: Option<&Regs>,
) -> i32 {
    if lifecycle::finished() || mtd.recursion_guard {
        return -1;
    }
    mtd.recursion_guard = true;

    if !mtd.prepared {
        lifecycle::thread_prepare(sess, mtd);
    }

    let (result, tr) = filter::entry_check(sess, mtd, child_ip);
    if result == FilterResult::Out {
        mtd.recursion_guard = false;
        return -1;
    }

    let parent_loc = arch::parent_location(parent_loc, child_ip);

    let idx = mtd.idx;
    mtd.idx += 1;
    mtd.rstack[idx] = RStackEntry {
        depth: mtd.record_idx as u16,
        parent_loc,
        parent_ip: unsafe { *parent_loc },
        child_ip,
        start_time: clock::now_ns(),
        end_time: 0,
        flags: EntryFlags::default(),
        filter_depth: 0,
        specs: None,
        dyn_idx: INVALID_DYN_IDX,
    };

    // hijack: the callee's return first lands in the trampoline
    unsafe {
        *parent_loc = arch::return_trampoline();
    }

    filter::entry_record(sess, mtd, idx, &tr, regs);
    mtd.recursion_guard = false;
    0
}

/// mcount-style exit; pops the frame and yields the original return address
pub fn mcount_exit_impl(sess: &Session, mtd: &mut ThreadData, retval: usize) -> usize {
    mtd.recursion_guard = true;

    let idx = mtd.idx - 1;
    mtd.rstack[idx].end_time = clock::now_ns();
    filter::exit_record(sess, mtd, idx, Some(retval));

    let parent_ip = mtd.rstack[idx].parent_ip;

    // the frame must stay valid until everything above has read it
    compiler_fence(Ordering::SeqCst);

    mtd.idx -= 1;
    mtd.recursion_guard = false;
    parent_ip
}

/// cyg_profile-style entry: always pushes so the paired exit pops exactly
/// one frame; filtered-out calls carry NORECORD and a zero start time.
pub fn cygprof_entry_impl(sess: &Session, mtd: &mut ThreadData, parent_ip: usize, child_ip: usize) -> i32 {
    if lifecycle::finished() || mtd.recursion_guard {
        return -1;
    }
    mtd.recursion_guard = true;

    if !mtd.prepared {
        lifecycle::thread_prepare(sess, mtd);
    }

    let (result, tr) = filter::entry_check(sess, mtd, child_ip);

    let idx = mtd.idx;
    mtd.idx += 1;
    mtd.rstack[idx] = RStackEntry {
        depth: mtd.record_idx as u16,
        parent_loc: std::ptr::null_mut(),
        parent_ip,
        child_ip,
        start_time: 0,
        end_time: 0,
        flags: EntryFlags::default(),
        filter_depth: 0,
        specs: None,
        dyn_idx: INVALID_DYN_IDX,
    };

    if result == FilterResult::In {
        mtd.rstack[idx].start_time = clock::now_ns();
    } else {
        mtd.rstack[idx].flags.set(EntryFlags::NORECORD);
    }

    filter::entry_record(sess, mtd, idx, &tr, None);
    mtd.recursion_guard = false;
    0
}

pub fn cygprof_exit_impl(sess: &Session, mtd: &mut ThreadData) {
    if lifecycle::finished() || mtd.recursion_guard {
        return;
    }
    mtd.recursion_guard = true;

    let idx = mtd.idx - 1;
    if !mtd.rstack[idx].flags.has(EntryFlags::NORECORD) {
        mtd.rstack[idx].end_time = clock::now_ns();
    }
    filter::exit_record(sess, mtd, idx, None);

    compiler_fence(Ordering::SeqCst);

    mtd.idx -= 1;
    mtd.recursion_guard = false;
}

// ---------------------------------------------------------------------------
// Instrumentation ABI
// ---------------------------------------------------------------------------

/// Called by the arch `mcount` stub
#[no_mangle]
pub unsafe extern "C" fn ftrace_entry(parent_loc: *mut usize, child_ip: usize, regs: *const Regs) -> i32 {
    tls::with_mtd(|mtd| {
        if lifecycle::finished() || mtd.recursion_guard {
            return -1;
        }
        if !lifecycle::setup_done() {
            // library-only tracing: no loader constructor ran
            mtd.recursion_guard = true;
            lifecycle::init_from_env();
            mtd.recursion_guard = false;
        }
        let sess = match session::global() {
            Some(sess) => sess,
            None => return -1,
        };
        let regs = if regs.is_null() { None } else { Some(&*regs) };
        mcount_entry_impl(sess, mtd, parent_loc, child_ip, regs)
    })
    .unwrap_or(-1)
}

/// Called by the return trampoline; must always yield the original address
#[no_mangle]
pub unsafe extern "C" fn ftrace_exit(retval: usize) -> usize {
    tls::with_mtd(|mtd| {
        let sess = match session::global() {
            Some(sess) => sess,
            None => return 0,
        };
        mcount_exit_impl(sess, mtd, retval)
    })
    .unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn __cyg_profile_func_enter(child: *mut libc::c_void, parent: *mut libc::c_void) {
    let _ = tls::with_mtd(|mtd| {
        if lifecycle::finished() || mtd.recursion_guard {
            return;
        }
        if !lifecycle::setup_done() {
            mtd.recursion_guard = true;
            lifecycle::init_from_env();
            mtd.recursion_guard = false;
        }
        if let Some(sess) = session::global() {
            cygprof_entry_impl(sess, mtd, parent as usize, child as usize);
        }
    });
}

#[no_mangle]
pub extern "C" fn __cyg_profile_func_exit(_child: *mut libc::c_void, _parent: *mut libc::c_void) {
    let _ = tls::with_mtd(|mtd| {
        if let Some(sess) = session::global() {
            cygprof_exit_impl(sess, mtd);
        }
    });
}

/// Write every in-flight frame's original return address back
#[no_mangle]
pub extern "C" fn ftrace_restore() {
    let _ = tls::with_mtd(|mtd| mtd.restore_return_addresses());
}

/// Re-install the trampoline in every in-flight frame
#[no_mangle]
pub extern "C" fn ftrace_reset() {
    let _ = tls::with_mtd(|mtd| mtd.rehijack_return_addresses(arch::return_trampoline()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::session::TraceConfig;
    use crate::shmem::ShmemBuffer;
    use ftrace_core::record::{Record, RecordType, RECORD_SIZE};
    use ftrace_core::trigger::{ArgSpec, FilterMode, Trigger, TriggerTable};

    struct Harness {
        sess: Session,
        mtd: ThreadData,
    }

    impl Harness {
        fn new(config: TraceConfig, triggers: TriggerTable) -> Self {
            let sid = clock::gen_session_id().unwrap();
            let sess = Session::with_id(config, triggers, sid).unwrap();
            let mut mtd = ThreadData::new();
            mtd.alloc(sess.config().max_stack, sess.config().depth, sess.enabled());
            mtd.shmem
                .prepare(sess.sid(), clock::tid(), sess.config().bufsize, sess.pipe())
                .unwrap();
            Harness { sess, mtd }
        }

        fn enter(&mut self, child: usize) {
            assert_eq!(cygprof_entry_impl(&self.sess, &mut self.mtd, 0, child), 0);
        }

        fn leave(&mut self) {
            cygprof_exit_impl(&self.sess, &mut self.mtd);
        }

        fn records(&self) -> Vec<Record> {
            let data = self.mtd.shmem.curr_buf().map(|b| b.data().to_vec()).unwrap_or_default();
            let mut recs = Vec::new();
            let mut off = 0;
            while off + RECORD_SIZE <= data.len() {
                let rec = Record::decode(&data[off..]).unwrap();
                off += RECORD_SIZE;
                if rec.more {
                    // skip payload up to the next 8-byte boundary; payload
                    // length is not in the header, so stop at records only
                    // when the test uses payload-free streams
                    off += 8;
                }
                recs.push(rec);
            }
            recs
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let names: Vec<_> = (0..self.mtd.shmem.nr_buf())
                .map(|i| self.mtd.shmem.segment_name(i))
                .collect();
            self.mtd.shmem.finish(self.sess.pipe());
            for name in names {
                ShmemBuffer::unlink(&name);
            }
        }
    }

    #[test]
    fn test_fast_calls_below_threshold_not_emitted() {
        let mut h = Harness::new(
            TraceConfig::new().threshold_ns(10_000_000_000),
            TriggerTable::new(),
        );

        h.enter(0x100); // main
        h.enter(0x200); // f, returns quickly
        h.leave();
        h.leave();

        assert!(h.records().is_empty());
        assert_eq!(h.mtd.idx, 0);
    }

    #[test]
    fn test_trace_trigger_forces_whole_stack_out() {
        let mut table = TriggerTable::new();
        table.insert(0x300, Trigger::default().trace());
        let mut h = Harness::new(TraceConfig::new().threshold_ns(u64::MAX), table);

        h.enter(0x100); // main
        h.enter(0x200); // g
        h.enter(0x300); // h, TRACE trigger
        h.leave(); // h: flushes main, g, h
        h.leave(); // g: WRITTEN forces emission
        h.leave(); // main: WRITTEN forces emission

        let recs = h.records();
        let shape: Vec<(RecordType, u64, u16)> =
            recs.iter().map(|r| (r.rtype, r.addr, r.depth)).collect();
        assert_eq!(
            shape,
            vec![
                (RecordType::Entry, 0x100, 0),
                (RecordType::Entry, 0x200, 1),
                (RecordType::Entry, 0x300, 2),
                (RecordType::Exit, 0x300, 2),
                (RecordType::Exit, 0x200, 1),
                (RecordType::Exit, 0x100, 0),
            ]
        );
    }

    #[test]
    fn test_include_filter_projects_subtree() {
        let mut table = TriggerTable::new();
        table.insert(0xa00, Trigger::filter(FilterMode::In));
        let mut h = Harness::new(TraceConfig::new().filter_mode(FilterMode::In), table);

        h.enter(0x100); // main: outside the include set
        h.enter(0xa00); // a
        h.enter(0xb00); // b
        h.leave(); // b
        h.leave(); // a
        h.enter(0xc00); // main_tail: outside again
        h.leave();
        h.leave(); // main

        let recs = h.records();
        let shape: Vec<(RecordType, u64, u16)> =
            recs.iter().map(|r| (r.rtype, r.addr, r.depth)).collect();
        assert_eq!(
            shape,
            vec![
                (RecordType::Entry, 0xa00, 0),
                (RecordType::Entry, 0xb00, 1),
                (RecordType::Exit, 0xb00, 1),
                (RecordType::Exit, 0xa00, 0),
            ]
        );
        assert_eq!(h.mtd.idx, 0);
        assert_eq!(h.mtd.record_idx, 0);
    }

    #[test]
    fn test_mcount_hijack_and_argument_capture() {
        let add_addr = 0x5000usize;
        let mut table = TriggerTable::new();
        table.insert(
            add_addr as u64,
            Trigger::default().capture(vec![ArgSpec::arg(1, 4), ArgSpec::arg(2, 4)]),
        );
        let mut h = Harness::new(TraceConfig::new(), table);

        let mut regs = Regs::default();
        #[cfg(target_arch = "x86_64")]
        {
            regs.rdi = 3;
            regs.rsi = 5;
        }
        #[cfg(target_arch = "aarch64")]
        {
            regs.x0 = 3;
            regs.x1 = 5;
        }

        let original_ret = 0xcafe_f00dusize;
        let mut ret_slot = original_ret;

        let rc = mcount_entry_impl(&h.sess, &mut h.mtd, &mut ret_slot, add_addr, Some(&regs));
        assert_eq!(rc, 0);
        // return address hijacked to the trampoline
        assert_eq!(ret_slot, arch::return_trampoline());
        assert_eq!(h.mtd.idx, 1);

        let parent = mcount_exit_impl(&h.sess, &mut h.mtd, 8);
        assert_eq!(parent, original_ret);
        assert_eq!(h.mtd.idx, 0);

        let data = h.mtd.shmem.curr_buf().unwrap().data().to_vec();
        let entry = Record::decode(&data).unwrap();
        assert_eq!(entry.rtype, RecordType::Entry);
        assert_eq!(entry.addr, add_addr as u64);
        assert!(entry.more);
        assert_eq!(&data[RECORD_SIZE..RECORD_SIZE + 8], &[3, 0, 0, 0, 5, 0, 0, 0]);
    }

    #[test]
    fn test_filtered_mcount_entry_not_hijacked() {
        let mut table = TriggerTable::new();
        table.insert(0xa00, Trigger::filter(FilterMode::In));
        let mut h = Harness::new(TraceConfig::new().filter_mode(FilterMode::In), table);

        let mut ret_slot = 0x1111usize;
        let rc = mcount_entry_impl(&h.sess, &mut h.mtd, &mut ret_slot, 0x9999, None);
        assert_eq!(rc, -1);
        assert_eq!(ret_slot, 0x1111);
        assert_eq!(h.mtd.idx, 0);
    }

    #[test]
    fn test_recursion_guard_blocks_nested_hooks() {
        let mut h = Harness::new(TraceConfig::new(), TriggerTable::new());

        h.mtd.recursion_guard = true;
        let mut ret_slot = 0x2222usize;
        assert_eq!(mcount_entry_impl(&h.sess, &mut h.mtd, &mut ret_slot, 0x100, None), -1);
        assert_eq!(cygprof_entry_impl(&h.sess, &mut h.mtd, 0, 0x100), -1);
        assert_eq!(h.mtd.idx, 0);
        h.mtd.recursion_guard = false;
    }

    #[test]
    fn test_recover_trigger_restores_parent_addresses() {
        let mut table = TriggerTable::new();
        table.insert(0x200, Trigger::default().recover());
        let mut h = Harness::new(TraceConfig::new().threshold_ns(u64::MAX), table);

        let main_ret = 0xaaaausize;
        let f_ret = 0xbbbbusize;
        let mut main_slot = main_ret;
        let mut f_slot = f_ret;

        assert_eq!(mcount_entry_impl(&h.sess, &mut h.mtd, &mut main_slot, 0x100, None), 0);
        assert_eq!(main_slot, arch::return_trampoline());

        // RECOVER: ancestors see their natural callers during the call
        assert_eq!(mcount_entry_impl(&h.sess, &mut h.mtd, &mut f_slot, 0x200, None), 0);
        assert_eq!(main_slot, main_ret);
        assert_eq!(f_slot, arch::return_trampoline());

        // exit re-hijacks the remaining frames
        let parent = mcount_exit_impl(&h.sess, &mut h.mtd, 0);
        assert_eq!(parent, f_ret);
        assert_eq!(main_slot, arch::return_trampoline());

        let parent = mcount_exit_impl(&h.sess, &mut h.mtd, 0);
        assert_eq!(parent, main_ret);
    }

    #[test]
    fn test_trace_off_flushes_in_flight_frames() {
        let mut table = TriggerTable::new();
        table.insert(0xd00, Trigger::default().trace_off());
        let mut h = Harness::new(TraceConfig::new(), table);

        h.enter(0x100); // main, deferred
        assert!(h.records().is_empty());

        h.enter(0xd00); // turns tracing off: main must flush now
        let recs = h.records();
        assert_eq!(recs.len(), 1);
        assert_eq!((recs[0].rtype, recs[0].addr), (RecordType::Entry, 0x100));
        assert!(!h.sess.enabled());

        h.leave(); // d, disabled: no EXIT
        h.leave(); // main: tracing off, no EXIT
        assert_eq!(h.records().len(), 1);
        assert_eq!(h.mtd.idx, 0);
    }

    #[test]
    fn test_stack_and_record_depth_track_invariant() {
        let mut table = TriggerTable::new();
        table.insert(0xa00, Trigger::filter(FilterMode::In));
        let mut h = Harness::new(TraceConfig::new().filter_mode(FilterMode::In), table);

        h.enter(0x100); // NORECORD
        h.enter(0xa00);
        h.enter(0xb00);
        assert_eq!(h.mtd.idx, 3);
        assert_eq!(h.mtd.record_idx, 2);

        let norecord = h
            .mtd
            .rstack[..h.mtd.idx]
            .iter()
            .filter(|e| e.flags.has(EntryFlags::NORECORD))
            .count();
        assert_eq!(h.mtd.idx - norecord, h.mtd.record_idx);

        h.leave();
        h.leave();
        h.leave();
        assert_eq!(h.mtd.idx, 0);
        assert_eq!(h.mtd.record_idx, 0);
    }
}
