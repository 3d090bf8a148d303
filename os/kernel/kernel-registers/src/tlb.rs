//! Translation lookaside buffer maintenance.

#[cfg(all(feature = "asm", target_arch = "x86"))]
use kernel_memory_addresses::{Size4K, VirtualPage};

/// Drop the cached translation of one page on this CPU.
///
/// Required after changing or removing a mapping of the active directory.
///
/// # Safety
/// Privileged instruction; ring 0 only.
#[cfg(all(feature = "asm", target_arch = "x86"))]
#[inline]
pub unsafe fn invalidate_page(page: VirtualPage<Size4K>) {
    let va = page.base().as_u32();
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
}
