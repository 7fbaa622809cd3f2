//! Architecture-specific pieces: register snapshots, the `mcount` entry
//! stub and the return trampoline installed by the hijack.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{arg_reg, mcount, mcount_return, parent_location, Regs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{arg_reg, mcount, mcount_return, parent_location, Regs};
    } else {
        compile_error!("unsupported architecture");
    }
}

/// Address written into hijacked return slots
#[inline]
pub fn return_trampoline() -> usize {
    mcount_return as unsafe extern "C" fn() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trampoline_address() {
        assert_ne!(return_trampoline(), 0);
        assert_eq!(return_trampoline(), return_trampoline());
    }

    #[test]
    fn test_arg_reg_order() {
        let mut regs = Regs::default();
        set_args(&mut regs);
        assert_eq!(arg_reg(&regs, 1), 11);
        assert_eq!(arg_reg(&regs, 2), 22);
        assert_eq!(arg_reg(&regs, 0), 0);
        assert_eq!(arg_reg(&regs, 99), 0);
    }

    #[cfg(target_arch = "x86_64")]
    fn set_args(regs: &mut Regs) {
        regs.rdi = 11;
        regs.rsi = 22;
    }

    #[cfg(target_arch = "aarch64")]
    fn set_args(regs: &mut Regs) {
        regs.x0 = 11;
        regs.x1 = 22;
    }
}
