//! # Address Space (i386, two-level)
//!
//! The mapping operations of one [`Directory`], reached through
//! [`Vm::space`](crate::Vm::space) or [`Vm::kernel_space`](crate::Vm::kernel_space).
//!
//! ## Design
//!
//! - Missing page tables are allocated from the [`FrameAlloc`] on demand and
//!   linked with present + writable, plus `USER` when the mapping is a user
//!   mapping. Tables are only returned when their directory is destroyed.
//! - Unmapping writes a zero entry and never allocates a table.
//! - Search and mapping happen under one lock acquisition, so two callers can
//!   never be handed the same range.
//! - Every change to the active (kernel) directory invalidates the TLB entry
//!   of the page.

use crate::directory::Directory;
use crate::page_table::{DirectoryIndex, PageEntry, TableIndex, split_indices};
use crate::search::find_free_range;
use crate::tables::{ForeignTables, KernelWindow, PhysicalTables, TableAccess};
use crate::{FrameAlloc, FrameRun, Mmu, Vm, VmError, VmFlags};
use core::ptr;
use kernel_info::memory::{
    PAGE_SIZE, SCRATCH_DIRECTORY_PAGE, SCRATCH_TABLE_PAGE, SELF_MAP_SLOT, TABLE_ENTRIES, VM_LOWER_LIMIT, VM_UPPER_LIMIT,
};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress, VirtualPage};
use log::trace;

/// Number of 4 KiB pages in the 32-bit address space.
const ADDRESS_SPACE_PAGES: u64 = 1 << 20;

/// Handle to the mapping operations of a single address space.
pub struct AddressSpace<'v, 'a, M: Mmu, A: FrameAlloc> {
    vm: &'v Vm<'a, M, A>,
    directory: &'v Directory,
}

impl<'v, 'a, M: Mmu, A: FrameAlloc> AddressSpace<'v, 'a, M, A> {
    pub(crate) const fn new(vm: &'v Vm<'a, M, A>, directory: &'v Directory) -> Self {
        Self { vm, directory }
    }

    /// The manager this address space belongs to.
    #[inline]
    #[must_use]
    pub const fn vm(&self) -> &'v Vm<'a, M, A> {
        self.vm
    }

    #[inline]
    #[must_use]
    pub const fn directory(&self) -> &'v Directory {
        self.directory
    }

    /// Whether this is the kernel's own directory.
    #[inline]
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        ptr::eq(self.directory, &self.vm.kernel)
    }

    /// Map one page `virt → phys`.
    ///
    /// Mapping `phys = 0` with empty `flags` clears the entry.
    ///
    /// # Errors
    /// - [`VmError::InvalidAddress`]: misaligned address, `virt == 0`, a null
    ///   `phys` with non-empty flags, a page in the self-map window, or one
    ///   of the kernel directory's scratch pages.
    /// - [`VmError::InvalidArgument`]: unknown flag bits.
    /// - [`VmError::OutOfMemory`]: no frame for a new page table.
    pub fn map_page(&self, phys: PhysicalAddress, virt: VirtualAddress, flags: VmFlags) -> Result<(), VmError> {
        self.map_page_range(phys, virt, 1, flags)
    }

    /// Map `pages` consecutive pages `virt → phys`.
    ///
    /// Either every page is mapped or, on failure, none of them is.
    ///
    /// # Errors
    /// As [`map_page`](Self::map_page); additionally `pages == 0` is
    /// [`VmError::InvalidArgument`].
    pub fn map_page_range(
        &self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        pages: u32,
        flags: VmFlags,
    ) -> Result<(), VmError> {
        check_request(phys, pages, flags)?;
        check_target(virt, pages, self.is_kernel())?;
        let first = virt.page();
        self.with_tables(|t| map_range(t, self.vm.frames, phys, first, pages, flags))
    }

    /// Back both scratch pages with `guard`. Only bootstrap may touch them.
    pub(crate) fn map_scratch_pages(&self, guard: PhysicalAddress) -> Result<(), VmError> {
        let first = VirtualAddress::new(SCRATCH_DIRECTORY_PAGE).page();
        self.with_tables(|t| map_range(t, self.vm.frames, guard, first, 1, VmFlags::KERNEL))?;
        let first = VirtualAddress::new(SCRATCH_TABLE_PAGE).page();
        self.with_tables(|t| map_range(t, self.vm.frames, guard, first, 1, VmFlags::KERNEL))
    }

    /// Find `pages` unmapped pages anywhere in the address space and map them to `phys`.
    ///
    /// # Errors
    /// See [`alloc_limit`](Self::alloc_limit).
    pub fn alloc(&self, phys: PhysicalAddress, pages: u32, flags: VmFlags) -> Result<VirtualAddress, VmError> {
        self.alloc_limit(
            phys,
            pages,
            VirtualAddress::new(VM_LOWER_LIMIT),
            VirtualAddress::new(VM_UPPER_LIMIT),
            flags,
        )
    }

    /// Find `pages` unmapped pages inside `[lower, upper)` and map them to `phys`.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`]: no free run inside the window, or no frame
    ///   for a page table.
    /// - [`VmError::InvalidAddress`]: misaligned bounds or `phys`, or a null `phys`.
    /// - [`VmError::InvalidArgument`]: `pages == 0`, a window outside
    ///   `[VM_LOWER_LIMIT, VM_UPPER_LIMIT)`, or unknown flag bits.
    pub fn alloc_limit(
        &self,
        phys: PhysicalAddress,
        pages: u32,
        lower: VirtualAddress,
        upper: VirtualAddress,
        flags: VmFlags,
    ) -> Result<VirtualAddress, VmError> {
        check_request(phys, pages, flags)?;
        check_window(lower, upper)?;
        self.with_tables(|t| {
            let first = find_free_range(t, None, pages, lower..upper)?;
            map_range(t, self.vm.frames, phys, first, pages, flags)?;
            trace!("mapped {phys} ({pages} pages) at {}", first.base());
            Ok(first.base())
        })
    }

    /// Like [`alloc_limit`](Self::alloc_limit), but the range must be free in
    /// this directory **and** in the kernel directory; it is mapped into both.
    ///
    /// # Errors
    /// As [`alloc_limit`](Self::alloc_limit); calling this on the kernel
    /// directory itself is [`VmError::InvalidArgument`].
    pub fn alloc_two_sided_limit(
        &self,
        phys: PhysicalAddress,
        pages: u32,
        lower: VirtualAddress,
        upper: VirtualAddress,
        flags: VmFlags,
    ) -> Result<VirtualAddress, VmError> {
        if self.is_kernel() {
            return Err(VmError::InvalidArgument);
        }
        check_request(phys, pages, flags)?;
        check_window(lower, upper)?;

        let _own = self.directory.lock.lock();
        let kernel_lock = self.vm.kernel.lock.lock();
        let mut user = ForeignTables::new(self.vm, &kernel_lock, self.directory.root);
        let mut kernel = KernelWindow::new(self.vm.mmu);

        let first = find_free_range(&mut user, Some(&mut kernel), pages, lower..upper)?;
        map_range(&mut user, self.vm.frames, phys, first, pages, flags)?;
        if let Err(e) = map_range(&mut kernel, self.vm.frames, phys, first, pages, flags) {
            unmap_range(&mut user, first, pages);
            return Err(e);
        }

        trace!("mapped {phys} ({pages} pages) at {} on both sides", first.base());
        Ok(first.base())
    }

    /// Map physically scattered runs back to back into one free virtual range.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc); an empty list or an empty run is
    /// [`VmError::InvalidArgument`].
    pub fn map_scattered(&self, runs: &[FrameRun], flags: VmFlags) -> Result<VirtualAddress, VmError> {
        if runs.is_empty() {
            return Err(VmError::InvalidArgument);
        }
        let mut total = 0u32;
        for run in runs {
            check_request(run.base, run.pages, flags)?;
            total = total.checked_add(run.pages).ok_or(VmError::InvalidArgument)?;
        }

        self.with_tables(|t| {
            let first = find_free_range(
                t,
                None,
                total,
                VirtualAddress::new(VM_LOWER_LIMIT)..VirtualAddress::new(VM_UPPER_LIMIT),
            )?;

            let mut mapped = 0u32;
            for run in runs {
                let at = forward(first, mapped);
                if let Err(e) = map_range(t, self.vm.frames, run.base, at, run.pages, flags) {
                    unmap_range(t, first, mapped);
                    return Err(e);
                }
                mapped += run.pages;
            }
            trace!("mapped {} runs ({total} pages) at {}", runs.len(), first.base());
            Ok(first.base())
        })
    }

    /// Unmap `pages` pages starting at `virt`.
    ///
    /// The physical frames are not freed; that is up to whoever owns them.
    /// Pages whose table does not exist are skipped.
    ///
    /// # Errors
    /// - [`VmError::InvalidAddress`]: misaligned or null `virt`, a range
    ///   leaving the address space, or touching the self-map window or the
    ///   kernel directory's scratch pages.
    /// - [`VmError::InvalidArgument`]: `pages == 0`.
    pub fn free(&self, virt: VirtualAddress, pages: u32) -> Result<(), VmError> {
        if pages == 0 {
            return Err(VmError::InvalidArgument);
        }
        check_target(virt, pages, self.is_kernel())?;
        let first = virt.page();
        self.with_tables(|t| unmap_range(t, first, pages));
        Ok(())
    }

    /// Translate `virt` through this directory.
    ///
    /// # Errors
    /// [`VmError::InvalidAddress`] if the table or the entry is not present.
    pub fn resolve_address(&self, virt: VirtualAddress) -> Result<PhysicalAddress, VmError> {
        self.with_tables(|t| {
            let (slot, index) = split_indices(virt);
            let entry = t.table_if_present(slot).map(|table| table.get(index));
            match entry {
                Some(e) if e.is_present() => Ok(e.frame().join(virt.offset::<Size4K>())),
                _ => Err(VmError::InvalidAddress),
            }
        })
    }

    /// Number of page tables linked into this directory, not counting the self-map.
    #[must_use]
    pub fn page_tables(&self) -> usize {
        self.with_tables(|t| {
            let directory = t.directory();
            (0..TABLE_ENTRIES)
                .filter(|&slot| slot != SELF_MAP_SLOT)
                .filter(|&slot| directory.get(DirectoryIndex::new(slot)).is_present())
                .count()
        })
    }

    /// Run `f` with this directory's tables reachable and its lock held.
    fn with_tables<R>(&self, f: impl FnOnce(&mut dyn TableAccess) -> R) -> R {
        let _own = self.directory.lock.lock();
        if self.is_kernel() {
            if self.vm.paging_enabled() {
                f(&mut KernelWindow::new(self.vm.mmu))
            } else {
                f(&mut PhysicalTables::new(self.vm.mmu, self.directory.root))
            }
        } else {
            let kernel_lock = self.vm.kernel.lock.lock();
            let mut tables = ForeignTables::new(self.vm, &kernel_lock, self.directory.root);
            f(&mut tables)
        }
    }
}

/// Validate flags, page count and the physical side of a request.
fn check_request(phys: PhysicalAddress, pages: u32, flags: VmFlags) -> Result<(), VmError> {
    if !VmFlags::is_valid_raw(flags.bits()) || pages == 0 {
        return Err(VmError::InvalidArgument);
    }
    if !phys.is_aligned::<Size4K>() || (phys.is_null() && !flags.is_empty()) {
        return Err(VmError::InvalidAddress);
    }
    if u64::from(phys.page::<Size4K>().index()) + u64::from(pages) > ADDRESS_SPACE_PAGES {
        return Err(VmError::InvalidAddress);
    }
    Ok(())
}

/// Validate the virtual side of an explicit mapping or unmapping.
///
/// The scratch pages are reserved in the kernel directory only.
fn check_target(virt: VirtualAddress, pages: u32, kernel: bool) -> Result<(), VmError> {
    if virt.is_null() || !virt.is_aligned::<Size4K>() {
        return Err(VmError::InvalidAddress);
    }
    let first = virt.page::<Size4K>().index();
    let end = u64::from(first) + u64::from(pages);
    if end > ADDRESS_SPACE_PAGES {
        return Err(VmError::InvalidAddress);
    }

    // The self-map window belongs to the paging code.
    let self_map = (SELF_MAP_SLOT as u64) << 10..(SELF_MAP_SLOT as u64 + 1) << 10;
    if u64::from(first) < self_map.end && end > self_map.start {
        return Err(VmError::InvalidAddress);
    }

    // Temporary mappings overwrite the scratch pages at will.
    let scratch = u64::from(SCRATCH_DIRECTORY_PAGE >> 12)..u64::from(SCRATCH_TABLE_PAGE >> 12) + 1;
    if kernel && u64::from(first) < scratch.end && end > scratch.start {
        return Err(VmError::InvalidAddress);
    }
    Ok(())
}

fn check_window(lower: VirtualAddress, upper: VirtualAddress) -> Result<(), VmError> {
    if !lower.is_aligned::<Size4K>() || !upper.is_aligned::<Size4K>() {
        return Err(VmError::InvalidAddress);
    }
    if lower.as_u32() < VM_LOWER_LIMIT || upper.as_u32() > VM_UPPER_LIMIT || lower >= upper {
        return Err(VmError::InvalidArgument);
    }
    Ok(())
}

#[inline]
fn forward(page: VirtualPage<Size4K>, count: u32) -> VirtualPage<Size4K> {
    VirtualPage::from_index(page.index() + count)
}

/// Map `pages` pages; on failure everything mapped so far is undone.
fn map_range<A: FrameAlloc>(
    t: &mut dyn TableAccess,
    frames: &A,
    phys: PhysicalAddress,
    first: VirtualPage<Size4K>,
    pages: u32,
    flags: VmFlags,
) -> Result<(), VmError> {
    for n in 0..pages {
        let entry = if flags.is_empty() {
            PageEntry::zero()
        } else {
            PageEntry::new((phys + n * PAGE_SIZE).page(), flags)
        };
        if let Err(e) = set_entry(t, frames, forward(first, n), entry, flags) {
            unmap_range(t, first, n);
            return Err(e);
        }
    }
    Ok(())
}

fn unmap_range(t: &mut dyn TableAccess, first: VirtualPage<Size4K>, pages: u32) {
    for n in 0..pages {
        let page = forward(first, n);
        let (slot, index) = split_indices(page.base());
        if !t.directory().get(slot).is_present() {
            continue;
        }
        t.table(slot).set(index, PageEntry::zero());
        t.mapping_changed(page);
    }
}

fn set_entry<A: FrameAlloc>(
    t: &mut dyn TableAccess,
    frames: &A,
    page: VirtualPage<Size4K>,
    entry: PageEntry,
    flags: VmFlags,
) -> Result<(), VmError> {
    let (slot, index): (_, TableIndex) = split_indices(page.base());
    let link = t.directory().get(slot);

    if !link.is_present() {
        if entry.raw() == 0 {
            return Ok(());
        }
        let frame = frames.alloc_4k().ok_or(VmError::OutOfMemory)?;
        t.directory().set(slot, PageEntry::new(frame, flags.directory_entry_for()));
        t.table_linked(slot);
        t.table(slot).zero();
        trace!("page table for {} at {}", slot.base(), frame.base());
    } else if flags.contains(VmFlags::USER) && !link.flags().contains(VmFlags::USER) {
        t.directory().set(slot, link.with_flags(link.flags() | VmFlags::USER));
    }

    t.table(slot).set(index, entry);
    t.mapping_changed(page);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_validated() {
        let pa = PhysicalAddress::new(0x20_0000);
        assert_eq!(check_request(pa, 0, VmFlags::KERNEL), Err(VmError::InvalidArgument));
        assert_eq!(
            check_request(pa, 1, VmFlags::from_bits_retain(0x80)),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            check_request(PhysicalAddress::new(0x20_0010), 1, VmFlags::KERNEL),
            Err(VmError::InvalidAddress)
        );
        assert_eq!(
            check_request(PhysicalAddress::zero(), 1, VmFlags::KERNEL),
            Err(VmError::InvalidAddress)
        );
        assert_eq!(check_request(PhysicalAddress::zero(), 1, VmFlags::empty()), Ok(()));
        assert_eq!(
            check_request(PhysicalAddress::new(0xFFFF_F000), 2, VmFlags::KERNEL),
            Err(VmError::InvalidAddress)
        );
    }

    #[test]
    fn targets_are_validated() {
        let va = VirtualAddress::new;
        assert_eq!(check_target(va(0), 1, true), Err(VmError::InvalidAddress));
        assert_eq!(check_target(va(0x1001), 1, true), Err(VmError::InvalidAddress));
        assert_eq!(check_target(va(0x3FBF_F000), 2, false), Err(VmError::InvalidAddress));
        assert_eq!(check_target(va(0x3FBF_F000), 1, false), Ok(()));
        assert_eq!(check_target(va(0x4000_0000), 1, true), Ok(()));
        assert_eq!(check_target(va(0xFFFF_F000), 1, true), Ok(()));
        assert_eq!(check_target(va(0xFFFF_F000), 2, true), Err(VmError::InvalidAddress));
    }

    #[test]
    fn scratch_pages_are_reserved_in_the_kernel_directory() {
        let va = VirtualAddress::new;
        assert_eq!(check_target(va(0x3FBF_E000), 1, true), Err(VmError::InvalidAddress));
        assert_eq!(check_target(va(0x3FBF_F000), 1, true), Err(VmError::InvalidAddress));
        assert_eq!(check_target(va(0x3FBF_C000), 3, true), Err(VmError::InvalidAddress));
        assert_eq!(check_target(va(0x3FBF_D000), 1, true), Ok(()));
        assert_eq!(check_target(va(0x3FBF_E000), 2, false), Ok(()));
    }

    #[test]
    fn windows_are_validated() {
        let va = VirtualAddress::new;
        assert_eq!(check_window(va(0x1000), va(0xFFFF_F000)), Ok(()));
        assert_eq!(check_window(va(0x1800), va(0x4000)), Err(VmError::InvalidAddress));
        assert_eq!(check_window(va(0), va(0x4000)), Err(VmError::InvalidArgument));
        assert_eq!(check_window(va(0x4000), va(0x4000)), Err(VmError::InvalidArgument));
    }
}
