//! Conservative stack discovery.
//!
//! The collector has no cooperation from the mutator, so it treats every
//! machine-word-aligned value on the call stack as a potential heap pointer.
//! This module produces the byte interval to scan and spills the callee-saved
//! registers into a local buffer first, so pointers that currently live only
//! in registers are visible to the scan as well.

use core::ptr;

/// Number of words reserved for a register spill. Large enough for the
/// callee-saved set of every supported architecture.
pub const SPILL_SLOTS: usize = 12;

/// Snapshot of the callee-saved registers, held on the collector's own frame
/// so the conservative scan walks over it.
#[derive(Debug)]
pub struct RegisterSpill(#[allow(dead_code)] [usize; SPILL_SLOTS]);

/// The normalized stack interval to scan: `low < high` regardless of the
/// machine's stack growth direction.
#[derive(Debug, Clone, Copy)]
pub struct StackBounds {
    /// Lowest address of the interval (inclusive).
    pub low: usize,
    /// Highest address of the interval (exclusive).
    pub high: usize,
}

/// The interval covering every active frame of the calling thread, from the
/// caller's deepest frame up to the thread's stack top.
pub fn current_bounds() -> StackBounds {
    let frame = frame_marker();
    let top = thread_stack_top();
    let (low, high) = if frame < top { (frame, top) } else { (top, frame) };
    StackBounds { low, high }
}

/// Address of a local in the deepest active frame. Must not be inlined, so
/// the marker is guaranteed to sit below every caller frame.
#[inline(never)]
fn frame_marker() -> usize {
    let marker: usize = 0;
    std::hint::black_box(ptr::addr_of!(marker) as usize)
}

/// Highest address of the calling thread's stack.
#[cfg(target_os = "linux")]
fn thread_stack_top() -> usize {
    // SAFETY: the attr object is initialized by pthread_getattr_np for the
    // calling thread and destroyed before returning; both out-pointers are
    // valid locals.
    unsafe {
        let mut attr: libc::pthread_attr_t = core::mem::zeroed();
        let rc = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
        assert_eq!(rc, 0, "pthread_getattr_np failed");

        let mut stack_addr: *mut libc::c_void = ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
        assert_eq!(rc, 0, "pthread_attr_getstack failed");

        stack_addr as usize + stack_size
    }
}

/// Highest address of the calling thread's stack.
#[cfg(target_os = "macos")]
fn thread_stack_top() -> usize {
    // SAFETY: pthread_get_stackaddr_np is infallible for the calling thread
    // and returns the high end of its stack.
    unsafe { libc::pthread_get_stackaddr_np(libc::pthread_self()) as usize }
}

/// Highest address of the calling thread's stack.
///
/// Fallback for platforms without a stack-bounds query: the environment
/// block sits at the top of the initial process stack, so its address is a
/// usable upper bound for the main thread.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn thread_stack_top() -> usize {
    // SAFETY: environ is initialized by the C runtime before main runs.
    unsafe { libc::environ as usize }
}

/// Spill the callee-saved registers into a buffer the scan will cover.
#[cfg(target_arch = "x86_64")]
pub fn spill_registers() -> RegisterSpill {
    let mut slots = [0usize; SPILL_SLOTS];
    // SAFETY: writes six words through a valid pointer into `slots`; no other
    // memory is touched and no register state is modified.
    unsafe {
        core::arch::asm!(
            "mov [{0}], rbx",
            "mov [{0} + 8], rbp",
            "mov [{0} + 16], r12",
            "mov [{0} + 24], r13",
            "mov [{0} + 32], r14",
            "mov [{0} + 40], r15",
            in(reg) slots.as_mut_ptr(),
            options(nostack, preserves_flags)
        );
    }
    RegisterSpill(slots)
}

/// Spill the callee-saved registers into a buffer the scan will cover.
#[cfg(target_arch = "aarch64")]
pub fn spill_registers() -> RegisterSpill {
    let mut slots = [0usize; SPILL_SLOTS];
    // SAFETY: writes ten words through a valid pointer into `slots`; no other
    // memory is touched and no register state is modified.
    unsafe {
        core::arch::asm!(
            "stp x19, x20, [{0}]",
            "stp x21, x22, [{0}, #16]",
            "stp x23, x24, [{0}, #32]",
            "stp x25, x26, [{0}, #48]",
            "stp x27, x28, [{0}, #64]",
            in(reg) slots.as_mut_ptr(),
            options(nostack, preserves_flags)
        );
    }
    RegisterSpill(slots)
}

/// Spill the callee-saved registers into a buffer the scan will cover.
///
/// On architectures without a dedicated spill sequence the buffer stays
/// zeroed; the scan then covers the stack alone.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn spill_registers() -> RegisterSpill {
    RegisterSpill([0; SPILL_SLOTS])
}
