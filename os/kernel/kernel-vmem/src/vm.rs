//! # Virtual memory manager
//!
//! [`Vm`] owns the kernel directory and creates, hands out and destroys the
//! directories of other address spaces.
//!
//! ## Bootstrap
//!
//! [`Vm::init`] runs with paging off. It builds the kernel directory in
//! physical memory, identity maps everything the kernel is currently using,
//! prepares the scratch slots and the shared kernel range, and then turns
//! paging on:
//!
//! ```text
//!  0x0000_0000  unmapped (null guard)
//!  0x000A_0000  video memory            identity
//!  ...          kernel image, stack,    identity
//!               boot info, modules
//!  0x3FBF_E000  scratch directory page  → guard frame
//!  0x3FBF_F000  scratch table page      → guard frame
//!  0x3FC0_0000  self-map window (tables of the active directory)
//!  0xFF00_0000  shared kernel range     tables pre-created, linked everywhere
//! ```

use crate::address_space::AddressSpace;
use crate::directory::Directory;
use crate::page_table::{DirectoryIndex, PageDirectory, PageEntry};
use crate::tables::{KernelWindow, PhysicalTables, TableAccess};
use crate::temporary::TemporaryMapping;
use crate::{FrameAlloc, Mmu, VmError, VmFlags};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::boot::{BootInfo, PhysicalRegion};
use kernel_info::memory::{PAGE_SIZE, SCRATCH_DIRECTORY_PAGE, SHARED_SLOTS, VIDEO_MEMORY};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use log::{debug, error, info};

const SHARED_COUNT: usize = SHARED_SLOTS.end - SHARED_SLOTS.start;

/// The virtual memory manager.
///
/// Borrowing the [`Mmu`] and the [`FrameAlloc`] keeps both singletons
/// explicit; a kernel holds one `Vm` for its whole lifetime.
pub struct Vm<'a, M: Mmu, A: FrameAlloc> {
    pub(crate) mmu: &'a M,
    pub(crate) frames: &'a A,
    pub(crate) kernel: Directory,
    pub(crate) guard_frame: PhysicalPage<Size4K>,
    paging: AtomicBool,
}

impl<'a, M: Mmu, A: FrameAlloc> Vm<'a, M, A> {
    /// Build the kernel directory and enable paging.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the frame allocator cannot provide the
    /// directory, the guard frame or a page table. Any other error means the
    /// boot information describes memory that cannot be identity mapped.
    ///
    /// # Safety
    /// Must run once, with paging disabled, on memory described by `boot`.
    /// Every frame the running code touches must lie in one of the regions
    /// of `boot`; after this returns, only those are mapped.
    pub unsafe fn init(boot: &BootInfo<'_>, frames: &'a A, mmu: &'a M) -> Result<Self, VmError> {
        let vm = Self::build(boot, frames, mmu).inspect_err(|e| error!("virtual memory bootstrap failed: {e}"))?;

        // Safety: the kernel directory identity maps everything in `boot`,
        // which by contract covers the running code.
        unsafe {
            mmu.activate(vm.kernel.root);
            mmu.enable_paging();
        }
        vm.paging.store(true, Ordering::Release);

        info!(
            "paging enabled; kernel directory at {}, {} page tables",
            vm.kernel.root.base(),
            vm.kernel_space().page_tables()
        );
        Ok(vm)
    }

    fn build(boot: &BootInfo<'_>, frames: &'a A, mmu: &'a M) -> Result<Self, VmError> {
        let root = frames.alloc_4k().ok_or(VmError::OutOfMemory)?;
        let mut tables = PhysicalTables::new(mmu, root);
        let directory = tables.directory();
        directory.zero();
        directory.install_self_map(root);

        let guard_frame = frames.alloc_4k().ok_or(VmError::OutOfMemory)?;
        // Safety: paging is off and the frame was just handed to us.
        unsafe { mmu.phys_to_mut::<[u8; PAGE_SIZE as usize]>(guard_frame.base()) }.fill(0);

        let vm = Self {
            mmu,
            frames,
            kernel: Directory::new(root),
            guard_frame,
            paging: AtomicBool::new(false),
        };

        let kernel = vm.kernel_space();
        let video = PhysicalRegion::from_bounds(
            PhysicalAddress::new(VIDEO_MEMORY.start),
            PhysicalAddress::new(VIDEO_MEMORY.end),
        );
        identity_map(&kernel, &boot.kernel_image)?;
        identity_map(&kernel, &boot.kernel_stack)?;
        identity_map(&kernel, &video)?;
        identity_map(&kernel, &boot.info_block)?;
        for module in boot.modules {
            identity_map(&kernel, &module.payload)?;
            identity_map(&kernel, &module.name)?;
        }

        kernel.map_scratch_pages(guard_frame.base())?;

        // The shared range must exist before the first directory copies it.
        for slot in SHARED_SLOTS {
            let slot = DirectoryIndex::new(slot);
            if tables.directory().get(slot).is_present() {
                continue;
            }
            let frame = frames.alloc_4k().ok_or(VmError::OutOfMemory)?;
            tables.directory().set(slot, PageEntry::new(frame, VmFlags::KERNEL));
            tables.table(slot).zero();
        }

        Ok(vm)
    }

    /// The kernel's address space.
    #[inline]
    #[must_use]
    pub const fn kernel_space(&self) -> AddressSpace<'_, 'a, M, A> {
        AddressSpace::new(self, &self.kernel)
    }

    /// The address space of `directory`.
    #[inline]
    #[must_use]
    pub const fn space<'v>(&'v self, directory: &'v Directory) -> AddressSpace<'v, 'a, M, A> {
        AddressSpace::new(self, directory)
    }

    /// The kernel directory.
    #[inline]
    #[must_use]
    pub const fn kernel_directory(&self) -> &Directory {
        &self.kernel
    }

    #[inline]
    #[must_use]
    pub fn paging_enabled(&self) -> bool {
        self.paging.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &'a A {
        self.frames
    }

    #[inline]
    #[must_use]
    pub const fn mmu(&self) -> &'a M {
        self.mmu
    }

    /// Create an empty address space.
    ///
    /// The new directory maps itself and shares the kernel's high range, and
    /// nothing else.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`]: no frame for the directory.
    /// - [`VmError::InvalidArgument`]: paging is not enabled yet.
    pub fn create_directory(&self) -> Result<Directory, VmError> {
        if !self.paging_enabled() {
            return Err(VmError::InvalidArgument);
        }
        let root = self.frames.alloc_4k().ok_or(VmError::OutOfMemory)?;

        let kernel_lock = self.kernel.lock.lock();
        let mut shared = [PageEntry::zero(); SHARED_COUNT];
        shared.copy_from_slice(KernelWindow::new(self.mmu).directory().shared());

        let mut mapping = TemporaryMapping::new(self, &kernel_lock, scratch_directory(), root);
        let directory: &mut PageDirectory = mapping.get();
        directory.zero();
        directory.install_self_map(root);
        directory.link_shared(&shared);
        drop(mapping);

        debug!("created directory at {}", root.base());
        Ok(Directory::new(root))
    }

    /// Destroy an address space created by [`create_directory`](Self::create_directory).
    ///
    /// Frees the directory frame and every page table it owns. Frames mapped
    /// *by* the directory are not touched. The shared kernel tables stay.
    ///
    /// The directory must not be active on any CPU.
    pub fn destroy_directory(&self, directory: Directory) {
        let root = directory.root;
        debug_assert!(root != self.kernel.root);

        let kernel_lock = self.kernel.lock.lock();
        let mut mapping = TemporaryMapping::new(self, &kernel_lock, scratch_directory(), root);
        let mut tables = 0usize;
        for entry in mapping.get::<PageDirectory>().private_tables() {
            self.frames.free_4k(entry.frame());
            tables += 1;
        }
        drop(mapping);
        drop(kernel_lock);

        self.frames.free_4k(root);
        debug!("destroyed directory at {} ({tables} page tables)", root.base());
    }

    /// View the memory at `va` of the active directory as a `T`.
    ///
    /// # Safety
    /// See [`Mmu::virt_to_mut`].
    #[inline]
    pub unsafe fn virt_to_mut<'m, T>(&self, va: VirtualAddress) -> &'m mut T {
        unsafe { self.mmu.virt_to_mut(va) }
    }

    /// Fill `len` bytes at `va` with `value`.
    ///
    /// # Safety
    /// The range must be mapped writable in the active directory and not
    /// referenced by anyone else.
    pub unsafe fn fill(&self, va: VirtualAddress, len: u32, value: u8) {
        for_each_chunk(va, len, |at, chunk| {
            // Safety: forwarded from the caller; a chunk never crosses a page.
            let page: &mut [u8; PAGE_SIZE as usize] = unsafe { self.mmu.virt_to_mut(at.align_down::<Size4K>()) };
            let start = at.offset::<Size4K>().as_u32() as usize;
            page[start..start + chunk].fill(value);
        });
    }

    /// Zero `len` bytes at `va`.
    ///
    /// # Safety
    /// As [`fill`](Self::fill).
    #[inline]
    pub unsafe fn zero(&self, va: VirtualAddress, len: u32) {
        unsafe { self.fill(va, len, 0) }
    }

    /// Copy `bytes` to `va`.
    ///
    /// # Safety
    /// As [`fill`](Self::fill).
    pub unsafe fn write_bytes(&self, va: VirtualAddress, bytes: &[u8]) {
        let mut done = 0;
        for_each_chunk(va, byte_len(bytes.len()), |at, chunk| {
            // Safety: forwarded from the caller.
            let page: &mut [u8; PAGE_SIZE as usize] = unsafe { self.mmu.virt_to_mut(at.align_down::<Size4K>()) };
            let start = at.offset::<Size4K>().as_u32() as usize;
            page[start..start + chunk].copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
        });
    }

    /// Copy `out.len()` bytes from `va`.
    ///
    /// # Safety
    /// The range must be mapped in the active directory.
    pub unsafe fn read_bytes(&self, va: VirtualAddress, out: &mut [u8]) {
        let mut done = 0;
        for_each_chunk(va, byte_len(out.len()), |at, chunk| {
            // Safety: forwarded from the caller.
            let page: &mut [u8; PAGE_SIZE as usize] = unsafe { self.mmu.virt_to_mut(at.align_down::<Size4K>()) };
            let start = at.offset::<Size4K>().as_u32() as usize;
            out[done..done + chunk].copy_from_slice(&page[start..start + chunk]);
            done += chunk;
        });
    }
}

impl<M: Mmu, A: FrameAlloc> core::fmt::Debug for Vm<'_, M, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("kernel", &self.kernel)
            .field("paging", &self.paging_enabled())
            .finish_non_exhaustive()
    }
}

const fn scratch_directory() -> VirtualPage<Size4K> {
    VirtualAddress::new(SCRATCH_DIRECTORY_PAGE).page()
}

/// Map every frame of `region` onto itself. Frame 0 stays unmapped.
fn identity_map<M: Mmu, A: FrameAlloc>(kernel: &AddressSpace<'_, '_, M, A>, region: &PhysicalRegion) -> Result<(), VmError> {
    let frames = region.frames();
    let first = frames.start.max(1);
    if first >= frames.end {
        return Ok(());
    }
    let base = PhysicalPage::<Size4K>::from_index(first).base();
    kernel.map_page_range(base, VirtualAddress::new(base.as_u32()), frames.end - first, VmFlags::KERNEL)
}

#[allow(clippy::cast_possible_truncation)]
const fn byte_len(len: usize) -> u32 {
    len as u32
}

/// Split `[va, va + len)` at page boundaries.
fn for_each_chunk(va: VirtualAddress, len: u32, mut f: impl FnMut(VirtualAddress, usize)) {
    let mut at = va;
    let mut left = len;
    while left > 0 {
        let room = PAGE_SIZE - at.offset::<Size4K>().as_u32();
        let chunk = room.min(left);
        f(at, chunk as usize);
        left -= chunk;
        at = VirtualAddress::new(at.as_u32().wrapping_add(chunk));
    }
}
