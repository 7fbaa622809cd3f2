//! Thread-local runtime state
//!
//! Each traced thread owns one `ThreadData`. The slot is created lazily on
//! the first hook invocation and torn down by the TLS destructor when the
//! thread exits (on Linux, Rust TLS destructors run through the same
//! pthread-key machinery the runtime needs).

use std::cell::UnsafeCell;

use crate::rstack::ThreadData;

thread_local! {
    static MTD: UnsafeCell<ThreadData> = const { UnsafeCell::new(ThreadData::new()) };
}

/// Run `f` with exclusive access to this thread's data.
///
/// Returns `None` once the TLS slot has been destroyed (thread teardown);
/// hooks firing that late become no-ops. Exclusivity is guaranteed by the
/// recursion guard: while a hook holds the `&mut`, nested hooks on the same
/// thread bail out before reaching this point.
#[inline]
pub fn with_mtd<R>(f: impl FnOnce(&mut ThreadData) -> R) -> Option<R> {
    MTD.try_with(|m| f(unsafe { &mut *m.get() })).ok()
}
