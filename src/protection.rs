//! VM protection flags and the page-alignment/flip-sequence helpers
//! described in the spec's "Memory-protection discipline" (§5).
//!
//! The raw [`crate::Engine::protect`] primitive stays unsequenced, per
//! the spec ("the engine does not sequence this") — [`flip_for_write`]
//! is an additive convenience for callers who want the documented
//! protect -> write -> restore -> invalidate sequence done for them.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::mach::{page_align_range, vm_prot_t};
use bitflags::bitflags;

bitflags! {
    /// Wraps the raw `vm_prot_t` bits (`VM_PROT_READ`/`WRITE`/`EXECUTE`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: vm_prot_t {
        const NONE = mach2::vm_prot::VM_PROT_NONE;
        const READ = mach2::vm_prot::VM_PROT_READ;
        const WRITE = mach2::vm_prot::VM_PROT_WRITE;
        const EXECUTE = mach2::vm_prot::VM_PROT_EXECUTE;
    }
}

impl Protection {
    pub const RX: Self = Self::READ.union(Self::EXECUTE);
    pub const RWX: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
    pub const RW: Self = Self::READ.union(Self::WRITE);
}

/// Performs the documented protect -> write -> restore -> invalidate
/// sequence for mutating a (typically RX) region in place.
///
/// `restore` is the protection to return the page window to once the
/// write completes; callers mutating executable code pass [`Protection::RX`].
pub fn flip_for_write(
    engine: &mut Engine,
    addr: u64,
    data: &[u8],
    restore: Protection,
) -> Result<(), EngineError> {
    let page_size = engine.page_size() as u64;
    let window = page_align_range(addr, data.len() as u64, page_size);
    let window_len = (window.end - window.start) as usize;

    engine.protect(window.start, window_len, Protection::RWX)?;

    let write_result = engine.write_memory(addr, data);

    // Always attempt to restore protection, even if the write failed,
    // so we don't leave the page window writable on the error path.
    let restore_result = engine.protect(window.start, window_len, restore);

    write_result?;
    restore_result?;

    crate::icache::invalidate(window.start, window_len);

    Ok(())
}

impl std::fmt::Display for Protection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = if self.contains(Self::READ) { 'r' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'w' } else { '-' };
        let x = if self.contains(Self::EXECUTE) { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}
