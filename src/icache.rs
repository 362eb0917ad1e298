//! Instruction cache invalidation.
//!
//! The spec's "Memory-protection discipline" (§5) calls out that failing
//! to invalidate the instruction cache after an in-place code patch
//! yields stale-fetch bugs on AArch64. This wraps the libSystem
//! `sys_icache_invalidate` entry point the same way the teacher declares
//! `pid_for_task` directly as an `extern "C"` item rather than going
//! through `libc` (the symbol isn't part of `libc`'s surface either).

unsafe extern "C" {
    /// void sys_icache_invalidate(void *start, size_t len);
    fn sys_icache_invalidate(start: *mut std::ffi::c_void, len: usize);
}

/// Invalidates the instruction cache for `[addr, addr+len)`. Callers
/// following the documented protect -> write -> restore -> invalidate
/// sequence should call this after restoring RX protection.
pub fn invalidate(addr: u64, len: usize) {
    // SAFETY: sys_icache_invalidate only reads the given range to flush
    // cache lines; it never dereferences through `start` as data.
    unsafe {
        sys_icache_invalidate(addr as *mut std::ffi::c_void, len);
    }
}
