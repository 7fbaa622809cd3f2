//! AArch64 entry stub and return trampoline
//!
//! `_mcount` runs after the instrumented prologue has set up the frame
//! record, so the caller's saved LR lives at `[old_x29 + 8]` and x30 still
//! holds the address inside the callee.

use std::arch::naked_asm;

/// Integer argument registers captured by the `mcount` stub, ascending
/// from the snapshot base.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Regs {
    pub x0: usize,
    pub x1: usize,
    pub x2: usize,
    pub x3: usize,
    pub x4: usize,
    pub x5: usize,
    pub x6: usize,
    pub x7: usize,
}

/// Value of the n-th integer argument (1-based, AAPCS order)
#[inline]
pub fn arg_reg(regs: &Regs, n: u8) -> usize {
    match n {
        1 => regs.x0,
        2 => regs.x1,
        3 => regs.x2,
        4 => regs.x3,
        5 => regs.x4,
        6 => regs.x5,
        7 => regs.x6,
        8 => regs.x7,
        _ => 0,
    }
}

/// Per-arch fixup of the parent return-address slot; none needed here
#[inline]
pub fn parent_location(parent_loc: *mut usize, _child_ip: usize) -> *mut usize {
    parent_loc
}

/// Entry stub called from instrumented prologues
#[unsafe(naked)]
#[export_name = "_mcount"]
pub unsafe extern "C" fn mcount() {
    naked_asm!(
        "stp x29, x30, [sp, -16]!",
        "mov x29, sp",
        "stp x6, x7, [sp, -16]!",
        "stp x4, x5, [sp, -16]!",
        "stp x2, x3, [sp, -16]!",
        "stp x0, x1, [sp, -16]!",
        // parent return-address slot: caller frame record + 8
        "ldr x0, [x29]",
        "add x0, x0, 8",
        // callee address
        "mov x1, x30",
        // register snapshot
        "mov x2, sp",
        "bl {entry}",
        "ldp x0, x1, [sp], 16",
        "ldp x2, x3, [sp], 16",
        "ldp x4, x5, [sp], 16",
        "ldp x6, x7, [sp], 16",
        "ldp x29, x30, [sp], 16",
        "ret",
        entry = sym crate::dispatch::ftrace_entry,
    )
}

/// Return trampoline. The callee's `ret` lands here; the dispatcher pops
/// the rstack frame and yields the original return address.
#[unsafe(naked)]
pub unsafe extern "C" fn mcount_return() {
    naked_asm!(
        "stp x0, x1, [sp, -16]!",
        "str q0, [sp, -16]!",
        // x0 already holds the integral return value
        "bl {exit}",
        "mov x16, x0",
        "ldr q0, [sp], 16",
        "ldp x0, x1, [sp], 16",
        "br x16",
        exit = sym crate::dispatch::ftrace_exit,
    )
}
