//! Filter and trigger engine
//!
//! Evaluates the per-call policy on entry (include/exclude, depth budget,
//! trace on/off, argument capture, recovery) and restores filter state on
//! exit. The engine mutates only per-thread state plus the session's
//! process-wide enable flag.

use ftrace_core::dbg::Domain;
use ftrace_core::filter::FilterResult;
use ftrace_core::tdbg;
use ftrace_core::tfatal;
use ftrace_core::trigger::{FilterMode, Trigger, TriggerFlags};

use crate::arch::{self, Regs};
use crate::rstack::{EntryFlags, ThreadData};
use crate::session::Session;
use crate::writer;

/// Entry-side policy check. Updates filter counters and depth; the
/// returned trigger is applied by `entry_record` once a frame exists.
pub fn entry_check(sess: &Session, mtd: &mut ThreadData, child: usize) -> (FilterResult, Trigger) {
    tdbg!(Domain::Filter, 3, "<{}> enter {:#x}", mtd.idx, child);

    if mtd.idx >= mtd.max_stack() {
        tfatal!("too deeply nested calls: {}", mtd.idx);
    }

    // original depth comes back at exit time
    mtd.filter.saved_depth = mtd.filter.depth;

    // already inside an excluded subtree
    if mtd.filter.out_count > 0 {
        return (FilterResult::Out, Trigger::default());
    }

    let tr = sess.triggers().lookup(child as u64);

    if tr.flags.has(TriggerFlags::FILTER) {
        match tr.fmode {
            FilterMode::In => mtd.filter.in_count += 1,
            FilterMode::Out => mtd.filter.out_count += 1,
            FilterMode::None => {}
        }
        // matched: the depth budget starts over
        mtd.filter.depth = sess.config().depth;
    } else if sess.config().filter_mode == FilterMode::In && mtd.filter.in_count == 0 {
        return (FilterResult::Out, tr);
    }

    if tr.flags.has(TriggerFlags::DEPTH) {
        mtd.filter.depth = tr.depth;
    }
    if tr.flags.has(TriggerFlags::TRACE_ON) {
        sess.set_enabled(true);
    }
    if tr.flags.has(TriggerFlags::TRACE_OFF) {
        sess.set_enabled(false);
    }

    // disabled calls are still tracked so the subtree nests correctly
    if !sess.enabled() {
        return (FilterResult::In, tr);
    }

    if mtd.filter.depth <= 0 {
        return (FilterResult::Out, tr);
    }

    mtd.filter.depth -= 1;
    (FilterResult::In, tr)
}

/// Apply the trigger to the freshly pushed frame at `idx`
pub fn entry_record(
    sess: &Session,
    mtd: &mut ThreadData,
    idx: usize,
    tr: &Trigger,
    regs: Option<&Regs>,
) {
    let norecord = mtd.filter.out_count > 0
        || (mtd.filter.in_count == 0 && sess.config().filter_mode == FilterMode::In);
    let saved_depth = mtd.filter.saved_depth;

    {
        let entry = &mut mtd.rstack[idx];
        if norecord {
            entry.flags.set(EntryFlags::NORECORD);
        }
        entry.filter_depth = saved_depth;

        if tr.flags.has(TriggerFlags::FILTER) {
            if tr.fmode == FilterMode::In {
                entry.flags.set(EntryFlags::FILTERED);
            } else {
                entry.flags.set(EntryFlags::NOTRACE);
            }
        }

        // the retval spec must survive until exit time
        if tr.flags.has(TriggerFlags::RETVAL) {
            entry.specs = tr.specs.clone();
            entry.flags.set(EntryFlags::RETVAL);
        }

        if tr.flags.has(TriggerFlags::TRACE) {
            entry.flags.set(EntryFlags::TRACE);
        }
    }

    if mtd.rstack[idx].flags.has(EntryFlags::NORECORD) {
        return;
    }

    mtd.record_idx += 1;

    if !sess.enabled() {
        mtd.rstack[idx].flags.set(EntryFlags::DISABLED);
    } else if tr.flags.has(TriggerFlags::ARGUMENT) {
        if let (Some(regs), Some(specs)) = (regs, tr.specs.as_deref()) {
            writer::save_argument(mtd, idx, specs, regs);
        }
    }

    if mtd.enable_cached != sess.enabled() {
        // flush in-flight frames when tracing just went off; turning back
        // on is handled on the exit path via the DISABLED flag
        if !sess.enabled() {
            writer::record_trace_data(sess, mtd, idx, None);
        }
        mtd.enable_cached = sess.enabled();
    }

    if tr.flags.has(TriggerFlags::RECOVER) && !mtd.rstack[idx].parent_loc.is_null() {
        // let the callee observe its natural caller; this frame keeps the
        // trampoline so its own exit still fires
        mtd.restore_return_addresses();
        unsafe {
            *mtd.rstack[idx].parent_loc = arch::return_trampoline();
        }
        mtd.rstack[idx].flags.set(EntryFlags::RECOVER);
    }
}

/// Restore filter state for the frame at `idx` and apply the emission rule
pub fn exit_record(sess: &Session, mtd: &mut ThreadData, idx: usize, mut retval: Option<usize>) {
    tdbg!(Domain::Filter, 3, "<{}> exit  {:#x}", idx, mtd.rstack[idx].child_ip);

    let flags = mtd.rstack[idx].flags;

    if flags.has(EntryFlags::FILTERED) {
        mtd.filter.in_count -= 1;
    } else if flags.has(EntryFlags::NOTRACE) {
        mtd.filter.out_count -= 1;
    }

    if flags.has(EntryFlags::RECOVER) {
        mtd.rehijack_return_addresses(arch::return_trampoline());
    }

    mtd.filter.depth = mtd.rstack[idx].filter_depth;

    if flags.has(EntryFlags::NORECORD) {
        return;
    }

    if mtd.record_idx > 0 {
        mtd.record_idx -= 1;
    }

    if !flags.has(EntryFlags::RETVAL) {
        retval = None;
    }

    let over_threshold = mtd.rstack[idx].duration() >= sess.config().threshold_ns;
    if over_threshold || flags.has(EntryFlags::WRITTEN) || flags.has(EntryFlags::TRACE) {
        if !sess.enabled() {
            return;
        }
        writer::record_trace_data(sess, mtd, idx, retval);
    }
}
