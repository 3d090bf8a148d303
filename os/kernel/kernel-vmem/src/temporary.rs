//! # Temporary mappings
//!
//! A directory that is not active cannot be edited through the self-map
//! window. Instead its frames are mapped, one at a time, into a scratch page
//! of the kernel's address space. [`TemporaryMapping`] owns such a scratch
//! page for as long as it lives and points it back at an idle guard frame
//! when dropped, on every exit path.

use crate::page_table::{PageDirectory, PageEntry, PageTable, split_indices};
use crate::tables::kernel_table_window;
use crate::{FrameAlloc, Mmu, Vm, VmFlags};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualPage};
use kernel_sync::SpinLockGuard;

mod sealed {
    pub trait Sealed {}
    impl Sealed for crate::page_table::PageDirectory {}
    impl Sealed for crate::page_table::PageTable {}
}

/// Page-sized structures that may be viewed through a temporary mapping.
pub(crate) trait PageFrame: sealed::Sealed {}
impl PageFrame for PageDirectory {}
impl PageFrame for PageTable {}

/// A scratch page of the kernel directory, pointed at some physical frame.
///
/// Can only be created while holding the kernel directory lock: the scratch
/// pages are kernel-global and the lock is what keeps two users apart.
pub(crate) struct TemporaryMapping<'g, M: Mmu> {
    mmu: &'g M,
    page: VirtualPage<Size4K>,
    target: PhysicalPage<Size4K>,
    idle: PhysicalPage<Size4K>,
    _kernel: &'g SpinLockGuard<'g, ()>,
}

impl<'g, M: Mmu> TemporaryMapping<'g, M> {
    /// Map `target` at the scratch `page`.
    ///
    /// Requires paging to be enabled: the scratch entry is written through
    /// the kernel's self-map window.
    pub(crate) fn new<A: FrameAlloc>(
        vm: &'g Vm<'_, M, A>,
        kernel: &'g SpinLockGuard<'g, ()>,
        page: VirtualPage<Size4K>,
        target: PhysicalPage<Size4K>,
    ) -> Self {
        debug_assert!(kernel.guards(&vm.kernel.lock), "temporary mapping without the kernel lock");
        debug_assert!(vm.paging_enabled(), "temporary mapping before paging is enabled");

        let mapping = Self {
            mmu: vm.mmu,
            page,
            target,
            idle: vm.guard_frame,
            _kernel: kernel,
        };
        mapping.point_at(target);
        mapping
    }

    /// Point the scratch page at another frame.
    pub(crate) fn retarget(&mut self, target: PhysicalPage<Size4K>) {
        if self.target != target {
            self.target = target;
            self.point_at(target);
        }
    }

    /// The mapped frame viewed as `T`.
    pub(crate) fn get<T: PageFrame>(&mut self) -> &mut T {
        // Safety: the scratch page maps `self.target`, which the caller
        // identified as a `T`, and `&mut self` keeps the view unique.
        unsafe { self.mmu.virt_to_mut(self.page.base()) }
    }

    fn point_at(&self, frame: PhysicalPage<Size4K>) {
        let (slot, index) = split_indices(self.page.base());
        // Safety: the scratch slot's table is created at init and the kernel
        // directory is active, so the window shows it.
        let table: &mut PageTable = unsafe { self.mmu.virt_to_mut(kernel_table_window(slot)) };
        table.set(index, PageEntry::new(frame, VmFlags::KERNEL));
        self.mmu.invalidate(self.page);
    }
}

impl<M: Mmu> Drop for TemporaryMapping<'_, M> {
    fn drop(&mut self) {
        self.point_at(self.idle);
    }
}
