//! Return stack and per-thread data
//!
//! The return stack is a bounded array indexed by call depth; nothing on the
//! hot path allocates. Argument scratch slots pair with rstack slots by
//! index: argbuf slot i always belongs to rstack slot i.

use std::sync::Arc;

use ftrace_core::constants::ARGBUF_SIZE;
use ftrace_core::filter::FilterState;
use ftrace_core::trigger::ArgSpec;

use crate::pipe::ControlPipe;
use crate::shmem::ShmemRing;

/// Per-call state bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFlags(u32);

impl EntryFlags {
    /// The ENTRY record has been emitted to a buffer
    pub const WRITTEN: EntryFlags = EntryFlags(1 << 0);
    /// Filtered out; tracked for nesting only
    pub const NORECORD: EntryFlags = EntryFlags(1 << 1);
    /// Matched an include filter (bumps `in_count`)
    pub const FILTERED: EntryFlags = EntryFlags(1 << 2);
    /// Matched an exclude filter (bumps `out_count`)
    pub const NOTRACE: EntryFlags = EntryFlags(1 << 3);
    /// Argument payload packed at entry
    pub const ARGUMENT: EntryFlags = EntryFlags(1 << 4);
    /// Return value wanted at exit
    pub const RETVAL: EntryFlags = EntryFlags(1 << 5);
    /// Force emission regardless of threshold
    pub const TRACE: EntryFlags = EntryFlags(1 << 6);
    /// Entered while tracing was globally off
    pub const DISABLED: EntryFlags = EntryFlags(1 << 7);
    /// Original return address restored for this call
    pub const RECOVER: EntryFlags = EntryFlags(1 << 8);

    #[inline]
    pub fn has(self, other: EntryFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn set(&mut self, other: EntryFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn clear(&mut self, other: EntryFlags) {
        self.0 &= !other.0;
    }
}

/// `dyn_idx` value for calls that did not come through a hooked PLT entry
pub const INVALID_DYN_IDX: u32 = u32::MAX;

/// One in-flight call
#[derive(Debug, Clone)]
pub struct RStackEntry {
    /// Recorded depth at entry (`record_idx`)
    pub depth: u16,
    /// Address of the slot holding the caller's return address;
    /// null for cyg_profile-style entries
    pub parent_loc: *mut usize,
    /// Original return address value
    pub parent_ip: usize,
    /// Callee address
    pub child_ip: usize,
    pub start_time: u64,
    pub end_time: u64,
    pub flags: EntryFlags,
    /// Filter depth to restore at exit
    pub filter_depth: i32,
    /// Capture spec kept for the retval at exit
    pub specs: Option<Arc<[ArgSpec]>>,
    pub dyn_idx: u32,
}

impl Default for RStackEntry {
    fn default() -> Self {
        RStackEntry {
            depth: 0,
            parent_loc: std::ptr::null_mut(),
            parent_ip: 0,
            child_ip: 0,
            start_time: 0,
            end_time: 0,
            flags: EntryFlags::default(),
            filter_depth: 0,
            specs: None,
            dyn_idx: INVALID_DYN_IDX,
        }
    }
}

impl RStackEntry {
    /// Whether this call produces records at all
    #[inline]
    pub fn recordable(&self) -> bool {
        !self.flags.has(EntryFlags::NORECORD) && !self.flags.has(EntryFlags::DISABLED)
    }

    #[inline]
    pub fn duration(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

/// Everything a traced thread owns
pub struct ThreadData {
    /// Blocks nested hooks while the runtime itself runs
    pub recursion_guard: bool,
    /// rstack/argbuf allocated, ring prepared
    pub prepared: bool,
    /// Current stack depth
    pub idx: usize,
    /// Logical recorded depth (ancestors not marked NORECORD)
    pub record_idx: usize,
    pub rstack: Vec<RStackEntry>,
    pub argbuf: Vec<u8>,
    pub filter: FilterState,
    /// Last observed value of the session enable flag
    pub enable_cached: bool,
    pub shmem: ShmemRing,
}

impl Default for ThreadData {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadData {
    /// An empty slot; nothing is allocated until the first hook fires.
    /// Const so the TLS slot needs no lazy initialization.
    pub const fn new() -> Self {
        ThreadData {
            recursion_guard: false,
            prepared: false,
            idx: 0,
            record_idx: 0,
            rstack: Vec::new(),
            argbuf: Vec::new(),
            filter: FilterState {
                depth: 0,
                in_count: 0,
                out_count: 0,
                saved_depth: 0,
            },
            enable_cached: true,
            shmem: ShmemRing::new(),
        }
    }

    /// Allocate the bounded stack and its argument scratch slots
    pub fn alloc(&mut self, max_stack: usize, filter_depth: i32, enabled: bool) {
        self.rstack = vec![RStackEntry::default(); max_stack];
        self.argbuf = vec![0u8; max_stack * ARGBUF_SIZE];
        self.filter = FilterState::new(filter_depth);
        self.enable_cached = enabled;
        self.prepared = true;
    }

    #[inline]
    pub fn max_stack(&self) -> usize {
        self.rstack.len()
    }

    /// The scratch slot paired with rstack slot `idx`
    #[inline]
    pub fn argbuf_slot_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.argbuf[idx * ARGBUF_SIZE..(idx + 1) * ARGBUF_SIZE]
    }

    /// The packed payload stored in slot `idx` (behind its length header)
    #[inline]
    pub fn arg_payload(&self, idx: usize) -> &[u8] {
        let slot = &self.argbuf[idx * ARGBUF_SIZE..(idx + 1) * ARGBUF_SIZE];
        let len = u32::from_le_bytes(slot[0..4].try_into().unwrap()) as usize;
        &slot[4..4 + len]
    }

    /// Length of the packed payload in slot `idx`
    #[inline]
    pub fn arg_payload_len(&self, idx: usize) -> usize {
        let off = idx * ARGBUF_SIZE;
        u32::from_le_bytes(self.argbuf[off..off + 4].try_into().unwrap()) as usize
    }

    /// Write every in-flight frame's original return address back.
    /// Top-down, matching the restore order of a recovery walk.
    pub fn restore_return_addresses(&mut self) {
        for i in (0..self.idx).rev() {
            let entry = &self.rstack[i];
            if !entry.parent_loc.is_null() {
                unsafe {
                    *entry.parent_loc = entry.parent_ip;
                }
            }
        }
    }

    /// Point every in-flight frame's return slot back at the trampoline
    pub fn rehijack_return_addresses(&mut self, trampoline: usize) {
        for i in (0..self.idx).rev() {
            let entry = &self.rstack[i];
            if !entry.parent_loc.is_null() {
                unsafe {
                    *entry.parent_loc = trampoline;
                }
            }
        }
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        // runs from the TLS destructor at thread exit; block any hook that
        // fires while we tear down
        self.recursion_guard = true;

        if self.shmem.is_prepared() {
            match crate::session::global() {
                Some(sess) => self.shmem.finish(sess.pipe()),
                None => self.shmem.finish(&ControlPipe::disabled()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_flags() {
        let mut fl = EntryFlags::default();
        fl.set(EntryFlags::WRITTEN);
        fl.set(EntryFlags::RETVAL);
        assert!(fl.has(EntryFlags::WRITTEN));
        assert!(!fl.has(EntryFlags::TRACE));
        fl.clear(EntryFlags::WRITTEN);
        assert!(!fl.has(EntryFlags::WRITTEN));
    }

    #[test]
    fn test_recordable() {
        let mut entry = RStackEntry::default();
        assert!(entry.recordable());
        entry.flags.set(EntryFlags::NORECORD);
        assert!(!entry.recordable());

        let mut entry = RStackEntry::default();
        entry.flags.set(EntryFlags::DISABLED);
        assert!(!entry.recordable());
    }

    #[test]
    fn test_alloc_sizes() {
        let mut mtd = ThreadData::new();
        assert!(!mtd.prepared);
        mtd.alloc(64, 16, true);
        assert!(mtd.prepared);
        assert_eq!(mtd.max_stack(), 64);
        assert_eq!(mtd.argbuf.len(), 64 * ARGBUF_SIZE);
        assert_eq!(mtd.filter.depth, 16);
    }

    #[test]
    fn test_argbuf_slot_pairing() {
        let mut mtd = ThreadData::new();
        mtd.alloc(4, 1, true);

        let slot = mtd.argbuf_slot_mut(2);
        slot[0..4].copy_from_slice(&3u32.to_le_bytes());
        slot[4..7].copy_from_slice(&[7, 8, 9]);

        assert_eq!(mtd.arg_payload_len(2), 3);
        assert_eq!(mtd.arg_payload(2), &[7, 8, 9]);
        assert_eq!(mtd.arg_payload_len(1), 0);
    }
}
