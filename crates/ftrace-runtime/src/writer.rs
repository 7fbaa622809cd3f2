//! Record encoder
//!
//! Emission is deferred: an ENTRY is not flushed when the call starts but
//! when one of its descendants (or the call itself) turns out to be worth
//! recording. `record_trace_data` walks back over ancestors whose ENTRY has
//! not been written yet, emits them oldest-first, then emits the EXIT of
//! the top frame if it already ended.

use std::ffi::CStr;

use ftrace_core::constants::ARGBUF_SIZE;
use ftrace_core::dbg::Domain;
use ftrace_core::record::{align_up, Record, RecordType};
use ftrace_core::trigger::{ArgFmt, ArgSpec};
use ftrace_core::{tdbg, twarn};

use crate::arch::{self, Regs};
use crate::rstack::{EntryFlags, ThreadData};
use crate::session::Session;

/// Where captured values come from
enum ValueSource<'a> {
    Args(&'a Regs),
    Retval(usize),
}

/// Pack values into an argbuf slot, skipping entries that do not match the
/// direction. Returns the payload size, or None when it cannot fit.
fn save_to_argbuf(slot: &mut [u8], specs: &[ArgSpec], source: &ValueSource) -> Option<u32> {
    let is_retval = matches!(source, ValueSource::Retval(_));
    let mut off = 4usize;

    for spec in specs {
        if spec.is_retval() != is_retval {
            continue;
        }

        let val = match source {
            ValueSource::Args(regs) => arch::arg_reg(regs, spec.idx),
            ValueSource::Retval(v) => *v,
        };

        match spec.fmt {
            ArgFmt::Fixed { size } => {
                let size = (size as usize).min(8);
                let padded = align_up(size, 4);
                if off + padded > ARGBUF_SIZE {
                    return None;
                }
                slot[off..off + size].copy_from_slice(&val.to_le_bytes()[..size]);
                slot[off + size..off + padded].fill(0);
                off += padded;
            }
            ArgFmt::Str => {
                if val == 0 {
                    // null pointer sentinel: len=4 followed by 0xff bytes
                    if off + 8 > ARGBUF_SIZE {
                        return None;
                    }
                    slot[off..off + 2].copy_from_slice(&4u16.to_le_bytes());
                    slot[off + 2..off + 6].fill(0xff);
                    slot[off + 6..off + 8].fill(0);
                    off += 8;
                } else {
                    let bytes = unsafe { CStr::from_ptr(val as *const libc::c_char) }.to_bytes();
                    let len = bytes.len();
                    let padded = align_up(2 + len + 1, 4);
                    if off + padded > ARGBUF_SIZE {
                        return None;
                    }
                    slot[off..off + 2].copy_from_slice(&(len as u16).to_le_bytes());
                    slot[off + 2..off + 2 + len].copy_from_slice(bytes);
                    slot[off + 2 + len..off + padded].fill(0);
                    off += padded;
                }
            }
        }
    }

    Some((off - 4) as u32)
}

/// Pack entry arguments for rstack slot `idx`; overflow drops the payload
pub fn save_argument(mtd: &mut ThreadData, idx: usize, specs: &[ArgSpec], regs: &Regs) {
    let slot = mtd.argbuf_slot_mut(idx);
    match save_to_argbuf(slot, specs, &ValueSource::Args(regs)) {
        Some(size) => {
            slot[0..4].copy_from_slice(&size.to_le_bytes());
            mtd.rstack[idx].flags.set(EntryFlags::ARGUMENT);
        }
        None => twarn!("argument data is too big"),
    }
}

/// Pack the return value for rstack slot `idx`; overflow clears RETVAL
pub fn save_retval(mtd: &mut ThreadData, idx: usize, retval: usize) {
    let specs = match mtd.rstack[idx].specs.clone() {
        Some(specs) => specs,
        None => {
            mtd.rstack[idx].flags.clear(EntryFlags::RETVAL);
            return;
        }
    };

    let slot = mtd.argbuf_slot_mut(idx);
    match save_to_argbuf(slot, &specs, &ValueSource::Retval(retval)) {
        Some(size) => slot[0..4].copy_from_slice(&size.to_le_bytes()),
        None => {
            twarn!("retval data is too big");
            mtd.rstack[idx].flags.clear(EntryFlags::RETVAL);
        }
    }
}

/// Append one ENTRY/EXIT record (plus payload) for rstack slot `idx`.
/// On success the slot is marked WRITTEN.
pub fn record_ret_stack(sess: &Session, mtd: &mut ThreadData, rtype: RecordType, idx: usize) -> bool {
    let (flags, depth, child_ip, time) = {
        let entry = &mtd.rstack[idx];
        let time = match rtype {
            RecordType::Entry => entry.start_time,
            RecordType::Exit => entry.end_time,
            RecordType::Lost => 0,
        };
        (entry.flags, entry.depth, entry.child_ip, time)
    };

    let with_payload = match rtype {
        RecordType::Entry => flags.has(EntryFlags::ARGUMENT),
        RecordType::Exit => flags.has(EntryFlags::RETVAL),
        RecordType::Lost => false,
    };

    let rec = Record {
        time,
        rtype,
        more: with_payload,
        depth,
        addr: child_ip as u64,
    };

    let payload_len = if with_payload { mtd.arg_payload_len(idx) } else { 0 };
    let ok = {
        let ThreadData { argbuf, shmem, .. } = mtd;
        let payload = if with_payload {
            let off = idx * ARGBUF_SIZE;
            Some(&argbuf[off + 4..off + 4 + payload_len])
        } else {
            None
        };
        shmem.append(sess.pipe(), &rec, payload)
    };

    if ok {
        mtd.rstack[idx].flags.set(EntryFlags::WRITTEN);
        tdbg!(Domain::Trace, 3, "rstack[{}] {:?} {:#x}", depth, rtype, child_ip);
    }
    ok
}

/// Deferred emission at an EXIT or forced flush.
///
/// Emits ENTRY records for every not-yet-written recordable ancestor of
/// `top` (oldest first), then the EXIT of `top` when it has ended. A failed
/// emission drops the rest of the walk; dropped slots keep WRITTEN unset so
/// a later exit retries them.
pub fn record_trace_data(sess: &Session, mtd: &mut ThreadData, top: usize, retval: Option<usize>) {
    let written = |mtd: &ThreadData, i: usize| mtd.rstack[i].flags.has(EntryFlags::WRITTEN);

    let mut start = top + 1;
    let mut count = 0usize;

    if !written(mtd, top) {
        start = top;
        while start > 0 && !written(mtd, start - 1) {
            start -= 1;
        }
        for i in start..=top {
            if mtd.rstack[i].recordable() {
                count += 1;
            }
        }
    }

    let has_exit = mtd.rstack[top].end_time != 0;
    if has_exit {
        count += 1;
    }

    tdbg!(Domain::Trace, 3, "task record count = {}", count);

    let mut remaining = count;
    for i in start..=top {
        if !mtd.rstack[i].recordable() {
            continue;
        }
        if !record_ret_stack(sess, mtd, RecordType::Entry, i) {
            mtd.shmem.add_lost(remaining.saturating_sub(1) as u64);
            return;
        }
        remaining -= 1;
    }

    if has_exit {
        if let Some(rv) = retval {
            save_retval(mtd, top, rv);
        }
        if !record_ret_stack(sess, mtd, RecordType::Exit, top) {
            mtd.shmem.add_lost(remaining.saturating_sub(1) as u64);
            return;
        }
        remaining -= 1;
    }

    debug_assert_eq!(remaining, 0);
}
