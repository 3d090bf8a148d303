//! # Reaching page tables
//!
//! The mapping algorithms are written once against [`TableAccess`]; the three
//! implementations differ only in how a directory and its tables become
//! addressable.

use crate::page_table::{DirectoryIndex, PageDirectory, PageTable, split_indices};
use crate::temporary::TemporaryMapping;
use crate::{FrameAlloc, Mmu, Vm};
use kernel_info::memory::{
    KERNEL_DIRECTORY_WINDOW, KERNEL_TABLE_WINDOW, PAGE_SIZE, SCRATCH_DIRECTORY_PAGE, SCRATCH_TABLE_PAGE,
    SHARED_SLOTS,
};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_sync::SpinLockGuard;

/// Where table `slot` of the active directory shows up in the self-map window.
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn kernel_table_window(slot: DirectoryIndex) -> VirtualAddress {
    VirtualAddress::new(KERNEL_TABLE_WINDOW + slot.as_usize() as u32 * PAGE_SIZE)
}

pub(crate) trait TableAccess {
    fn directory(&mut self) -> &mut PageDirectory;

    /// The table linked at `slot`. The directory entry must be present.
    fn table(&mut self, slot: DirectoryIndex) -> &mut PageTable;

    /// A fresh table frame was just linked at `slot`.
    fn table_linked(&mut self, _slot: DirectoryIndex) {}

    /// The entry for `page` was rewritten.
    fn mapping_changed(&mut self, page: VirtualPage<Size4K>);

    fn table_if_present(&mut self, slot: DirectoryIndex) -> Option<&PageTable> {
        if self.directory().get(slot).is_present() {
            Some(self.table(slot))
        } else {
            None
        }
    }
}

/// The kernel directory before paging is enabled.
pub(crate) struct PhysicalTables<'v, M: Mmu> {
    mmu: &'v M,
    root: PhysicalPage<Size4K>,
}

impl<'v, M: Mmu> PhysicalTables<'v, M> {
    pub(crate) const fn new(mmu: &'v M, root: PhysicalPage<Size4K>) -> Self {
        Self { mmu, root }
    }
}

impl<M: Mmu> TableAccess for PhysicalTables<'_, M> {
    fn directory(&mut self) -> &mut PageDirectory {
        // Safety: paging is off and `root` is the directory frame.
        unsafe { self.mmu.phys_to_mut(self.root.base()) }
    }

    fn table(&mut self, slot: DirectoryIndex) -> &mut PageTable {
        let frame = self.directory().get(slot).frame();
        // Safety: a present directory entry points at a table frame.
        unsafe { self.mmu.phys_to_mut(frame.base()) }
    }

    fn mapping_changed(&mut self, _page: VirtualPage<Size4K>) {}
}

/// The active kernel directory, through the self-map window.
pub(crate) struct KernelWindow<'v, M: Mmu> {
    mmu: &'v M,
}

impl<'v, M: Mmu> KernelWindow<'v, M> {
    pub(crate) const fn new(mmu: &'v M) -> Self {
        Self { mmu }
    }
}

impl<M: Mmu> TableAccess for KernelWindow<'_, M> {
    fn directory(&mut self) -> &mut PageDirectory {
        // Safety: the self-map slot maps the directory at this address.
        unsafe { self.mmu.virt_to_mut(VirtualAddress::new(KERNEL_DIRECTORY_WINDOW)) }
    }

    fn table(&mut self, slot: DirectoryIndex) -> &mut PageTable {
        // Safety: the entry is present, so the window page maps its table.
        unsafe { self.mmu.virt_to_mut(kernel_table_window(slot)) }
    }

    fn table_linked(&mut self, slot: DirectoryIndex) {
        self.mmu.invalidate(kernel_table_window(slot).page());
    }

    fn mapping_changed(&mut self, page: VirtualPage<Size4K>) {
        self.mmu.invalidate(page);
    }
}

/// Any directory other than the kernel's, through the scratch slots.
pub(crate) struct ForeignTables<'g, M: Mmu> {
    mmu: &'g M,
    directory: TemporaryMapping<'g, M>,
    table: TemporaryMapping<'g, M>,
}

impl<'g, M: Mmu> ForeignTables<'g, M> {
    pub(crate) fn new<A: FrameAlloc>(
        vm: &'g Vm<'_, M, A>,
        kernel: &'g SpinLockGuard<'g, ()>,
        root: PhysicalPage<Size4K>,
    ) -> Self {
        let directory = TemporaryMapping::new(vm, kernel, VirtualAddress::new(SCRATCH_DIRECTORY_PAGE).page(), root);
        let table = TemporaryMapping::new(vm, kernel, VirtualAddress::new(SCRATCH_TABLE_PAGE).page(), vm.guard_frame);
        Self {
            mmu: vm.mmu,
            directory,
            table,
        }
    }
}

impl<M: Mmu> TableAccess for ForeignTables<'_, M> {
    fn directory(&mut self) -> &mut PageDirectory {
        self.directory.get()
    }

    fn table(&mut self, slot: DirectoryIndex) -> &mut PageTable {
        let frame = self.directory.get::<PageDirectory>().get(slot).frame();
        self.table.retarget(frame);
        self.table.get()
    }

    fn mapping_changed(&mut self, page: VirtualPage<Size4K>) {
        // Shared tables are also live in the active kernel directory.
        let (slot, _) = split_indices(page.base());
        if SHARED_SLOTS.contains(&slot.as_usize()) {
            self.mmu.invalidate(page);
        }
    }
}
