//! x86_64 entry stub and return trampoline
//!
//! `mcount` is called from every instrumented prologue (after `push rbp;
//! mov rbp, rsp`), so the parent return-address slot is at `rbp + 8` and
//! the callee address is `mcount`'s own return address.

use std::arch::naked_asm;

/// Integer argument registers captured by the `mcount` stub.
///
/// Layout matches the stub's save order (ascending from the snapshot base):
/// ```text
/// 0x00: r9   0x08: r8   0x10: rcx
/// 0x18: rdx  0x20: rsi  0x28: rdi
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Regs {
    pub r9: usize,
    pub r8: usize,
    pub rcx: usize,
    pub rdx: usize,
    pub rsi: usize,
    pub rdi: usize,
}

/// Value of the n-th integer argument (1-based, SysV order)
#[inline]
pub fn arg_reg(regs: &Regs, n: u8) -> usize {
    match n {
        1 => regs.rdi,
        2 => regs.rsi,
        3 => regs.rdx,
        4 => regs.rcx,
        5 => regs.r8,
        6 => regs.r9,
        _ => 0,
    }
}

/// Per-arch fixup of the parent return-address slot; none needed here
#[inline]
pub fn parent_location(parent_loc: *mut usize, _child_ip: usize) -> *mut usize {
    parent_loc
}

/// Entry stub called from instrumented prologues.
///
/// Saves the argument registers, hands (parent_loc, child_ip, regs) to the
/// dispatcher and restores them. The extra 8 bytes keep the stack 16-byte
/// aligned at the inner call.
#[unsafe(naked)]
#[export_name = "mcount"]
pub unsafe extern "C" fn mcount() {
    naked_asm!(
        "sub rsp, 56",
        "mov [rsp + 40], rdi",
        "mov [rsp + 32], rsi",
        "mov [rsp + 24], rdx",
        "mov [rsp + 16], rcx",
        "mov [rsp + 8],  r8",
        "mov [rsp + 0],  r9",
        // parent return-address slot
        "lea rdi, [rbp + 8]",
        // callee address: our own return address
        "mov rsi, [rsp + 56]",
        // register snapshot
        "mov rdx, rsp",
        "call {entry}",
        "mov rdi, [rsp + 40]",
        "mov rsi, [rsp + 32]",
        "mov rdx, [rsp + 24]",
        "mov rcx, [rsp + 16]",
        "mov r8,  [rsp + 8]",
        "mov r9,  [rsp + 0]",
        "add rsp, 56",
        "ret",
        entry = sym crate::dispatch::ftrace_entry,
    )
}

/// Return trampoline. The callee's `ret` lands here; the dispatcher pops
/// the rstack frame and yields the original return address.
#[unsafe(naked)]
pub unsafe extern "C" fn mcount_return() {
    naked_asm!(
        "sub rsp, 32",
        "mov [rsp + 0], rax",
        "mov [rsp + 8], rdx",
        "movups [rsp + 16], xmm0",
        // integral return value for retval capture
        "mov rdi, rax",
        "call {exit}",
        // original return address
        "mov r11, rax",
        "movups xmm0, [rsp + 16]",
        "mov rdx, [rsp + 8]",
        "mov rax, [rsp + 0]",
        "add rsp, 32",
        "jmp r11",
        exit = sym crate::dispatch::ftrace_exit,
    )
}
