//! # Page-granular allocation
//!
//! Physical frames and a virtual range in one step. The heap builds its zones
//! on [`alloc_pages`]; [`kalloc`] and [`ualloc`] serve callers that want whole
//! pages and a plain byte count.

use kernel_memory_addresses::{Size4K, VirtualAddress, page_count};
use kernel_vmem::{AddressSpace, FrameAlloc, Mmu, Vm, VmError, VmFlags};
use log::trace;

/// Bookkeeping in front of every [`kalloc`] / [`ualloc`] block.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct BlockHeader {
    pages: u32,
    bytes: u32,
}

#[allow(clippy::cast_possible_truncation)]
const HEADER_SIZE: u32 = size_of::<BlockHeader>() as u32;

/// Allocate `pages` physically contiguous frames and map them anywhere in `space`.
///
/// # Errors
/// [`VmError::OutOfMemory`] when either the frames or the virtual range are
/// exhausted; frames taken before a failed mapping are returned.
pub fn alloc_pages<M: Mmu, A: FrameAlloc>(
    space: &AddressSpace<'_, '_, M, A>,
    pages: u32,
    flags: VmFlags,
) -> Result<VirtualAddress, VmError> {
    if pages == 0 {
        return Err(VmError::InvalidArgument);
    }
    let frames = space.vm().frames();
    let phys = frames.alloc_frames(pages).ok_or(VmError::OutOfMemory)?;
    space.alloc(phys, pages, flags).inspect_err(|_| frames.free_frames(phys, pages))
}

/// Unmap `pages` pages at `va` and return their frames.
///
/// The range must have come from [`alloc_pages`] on the same `space`.
///
/// # Errors
/// [`VmError::InvalidAddress`] if `va` is not mapped.
pub fn free_pages<M: Mmu, A: FrameAlloc>(
    space: &AddressSpace<'_, '_, M, A>,
    va: VirtualAddress,
    pages: u32,
) -> Result<(), VmError> {
    let phys = space.resolve_address(va)?;
    space.free(va, pages)?;
    space.vm().frames().free_frames(phys, pages);
    Ok(())
}

/// Allocate `bytes` of kernel memory, rounded up to whole pages.
///
/// # Errors
/// [`VmError::InvalidArgument`] for a zero size, otherwise as [`alloc_pages`].
pub fn kalloc<M: Mmu, A: FrameAlloc>(vm: &Vm<'_, M, A>, bytes: u32) -> Result<VirtualAddress, VmError> {
    alloc_block(vm, bytes, VmFlags::KERNEL)
}

/// Like [`kalloc`], but the pages are reachable from user mode.
///
/// # Errors
/// As [`kalloc`].
pub fn ualloc<M: Mmu, A: FrameAlloc>(vm: &Vm<'_, M, A>, bytes: u32) -> Result<VirtualAddress, VmError> {
    alloc_block(vm, bytes, VmFlags::USERLAND)
}

/// Release a block obtained from [`kalloc`] or [`ualloc`].
///
/// # Errors
/// [`VmError::InvalidAddress`] if `va` cannot be the start of such a block.
pub fn kfree<M: Mmu, A: FrameAlloc>(vm: &Vm<'_, M, A>, va: VirtualAddress) -> Result<(), VmError> {
    let base = VirtualAddress::new(va.as_u32().wrapping_sub(HEADER_SIZE));
    if !base.is_aligned::<Size4K>() || base.is_null() {
        return Err(VmError::InvalidAddress);
    }
    let kernel = vm.kernel_space();
    kernel.resolve_address(base)?;

    // Safety: `base` is mapped and, by contract, starts a block header.
    let header = *unsafe { vm.virt_to_mut::<BlockHeader>(base) };
    trace!("kfree {va}: {} bytes in {} pages", header.bytes, header.pages);
    free_pages(&kernel, base, header.pages)
}

fn alloc_block<M: Mmu, A: FrameAlloc>(vm: &Vm<'_, M, A>, bytes: u32, flags: VmFlags) -> Result<VirtualAddress, VmError> {
    if bytes == 0 {
        return Err(VmError::InvalidArgument);
    }
    let total = bytes.checked_add(HEADER_SIZE).ok_or(VmError::InvalidArgument)?;
    #[allow(clippy::cast_possible_truncation)]
    let pages = page_count(total as usize) as u32;

    let base = alloc_pages(&vm.kernel_space(), pages, flags)?;
    // Safety: the first page was just mapped for us.
    unsafe { *vm.virt_to_mut::<BlockHeader>(base) = BlockHeader { pages, bytes } };
    trace!("allocated {bytes} bytes in {pages} pages at {base}");
    Ok(base + HEADER_SIZE)
}

