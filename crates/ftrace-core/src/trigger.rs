//! Per-callee policy rules
//!
//! A trigger is keyed by callee address and mutates filter state and/or
//! requests argument capture when that callee is entered. The table is built
//! once before tracing begins; expression parsing and symbol resolution are
//! collaborators and hand the finished table to session init.

use std::collections::BTreeMap;
use std::sync::Arc;

/// Bitset of trigger actions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerFlags(u32);

impl TriggerFlags {
    /// Include/exclude this callee per `fmode`
    pub const FILTER: TriggerFlags = TriggerFlags(1 << 0);
    /// Override the remaining-depth budget
    pub const DEPTH: TriggerFlags = TriggerFlags(1 << 1);
    /// Turn tracing on for the whole process
    pub const TRACE_ON: TriggerFlags = TriggerFlags(1 << 2);
    /// Turn tracing off for the whole process
    pub const TRACE_OFF: TriggerFlags = TriggerFlags(1 << 3);
    /// Capture arguments at entry
    pub const ARGUMENT: TriggerFlags = TriggerFlags(1 << 4);
    /// Capture the return value at exit
    pub const RETVAL: TriggerFlags = TriggerFlags(1 << 5);
    /// Force emission of this subtree regardless of threshold
    pub const TRACE: TriggerFlags = TriggerFlags(1 << 6);
    /// Restore the original return address for the duration of the call
    pub const RECOVER: TriggerFlags = TriggerFlags(1 << 7);

    #[inline]
    pub fn has(self, other: TriggerFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn set(&mut self, other: TriggerFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Process-wide filtering mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterMode {
    /// Record everything
    #[default]
    None,
    /// Record only inside matched subtrees
    In,
    /// Record everything except matched subtrees
    Out,
}

/// `ArgSpec::idx` value marking a return-value entry
pub const ARG_IDX_RETVAL: u8 = 0;

/// Encoding of one captured value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgFmt {
    /// Fixed-size integral value, `size` bytes copied from the register
    Fixed { size: u8 },
    /// NUL-terminated string pointed to by the register
    Str,
}

/// One entry of an argument/retval capture spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    /// 1-based argument position, or `ARG_IDX_RETVAL`
    pub idx: u8,
    pub fmt: ArgFmt,
}

impl ArgSpec {
    pub fn arg(idx: u8, size: u8) -> Self {
        ArgSpec { idx, fmt: ArgFmt::Fixed { size } }
    }

    pub fn string(idx: u8) -> Self {
        ArgSpec { idx, fmt: ArgFmt::Str }
    }

    pub fn retval(size: u8) -> Self {
        ArgSpec { idx: ARG_IDX_RETVAL, fmt: ArgFmt::Fixed { size } }
    }

    #[inline]
    pub fn is_retval(&self) -> bool {
        self.idx == ARG_IDX_RETVAL
    }
}

/// Actions to apply when a callee address matches
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    pub flags: TriggerFlags,
    pub fmode: FilterMode,
    pub depth: i32,
    /// Capture specs in declaration order; shared with in-flight rstack
    /// entries that still need them at exit time.
    pub specs: Option<Arc<[ArgSpec]>>,
}

impl Trigger {
    pub fn filter(fmode: FilterMode) -> Self {
        let mut tr = Trigger::default();
        tr.flags.set(TriggerFlags::FILTER);
        tr.fmode = fmode;
        tr
    }

    pub fn depth(mut self, depth: i32) -> Self {
        self.flags.set(TriggerFlags::DEPTH);
        self.depth = depth;
        self
    }

    pub fn trace(mut self) -> Self {
        self.flags.set(TriggerFlags::TRACE);
        self
    }

    pub fn trace_on(mut self) -> Self {
        self.flags.set(TriggerFlags::TRACE_ON);
        self
    }

    pub fn trace_off(mut self) -> Self {
        self.flags.set(TriggerFlags::TRACE_OFF);
        self
    }

    pub fn recover(mut self) -> Self {
        self.flags.set(TriggerFlags::RECOVER);
        self
    }

    /// Attach capture specs; sets ARGUMENT and/or RETVAL from the entries
    pub fn capture(mut self, specs: Vec<ArgSpec>) -> Self {
        if specs.iter().any(|s| s.is_retval()) {
            self.flags.set(TriggerFlags::RETVAL);
        }
        if specs.iter().any(|s| !s.is_retval()) {
            self.flags.set(TriggerFlags::ARGUMENT);
        }
        self.specs = Some(specs.into());
        self
    }
}

/// Ordered map from callee address to trigger
#[derive(Debug, Default)]
pub struct TriggerTable {
    triggers: BTreeMap<u64, Trigger>,
}

impl TriggerTable {
    pub fn new() -> Self {
        TriggerTable::default()
    }

    pub fn insert(&mut self, addr: u64, trigger: Trigger) {
        self.triggers.insert(addr, trigger);
    }

    /// Look up the trigger for `addr`; an empty trigger when none matches
    pub fn lookup(&self, addr: u64) -> Trigger {
        self.triggers.get(&addr).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}
