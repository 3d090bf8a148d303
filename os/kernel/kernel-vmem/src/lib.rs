//! # Virtual Memory Support
//!
//! i386 two-level paging for the kernel: page directories, free-range search,
//! and the temporary-mapping trick used to edit address spaces that are not
//! currently active.
//!
//! ## What you get
//! - [`Vm`]: the kernel directory plus everything needed to create, edit and
//!   destroy further [`Directory`] instances.
//! - [`AddressSpace`]: the mapping operations of one directory
//!   (`map_page`, `alloc`, `alloc_two_sided_limit`, `free`, `resolve_address`, ...).
//! - Typed [`page_table`] structures and [`VmFlags`].
//! - Two seams to the outside world: [`FrameAlloc`] (physical frames) and
//!   [`Mmu`] (touching memory and driving the paging hardware).
//! - A software MMU in [`sim`] (feature `sim`) for tests.
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | Directory | Table | Offset |
//! ```
//!
//! ```text
//!  CR3 → Page Directory → Page Table → 4 KiB page
//!          (1024 PDEs)     (1024 PTEs)
//! ```
//!
//! A directory entry that is not present stands for 4 MiB of unmapped space;
//! searches count it as 1024 free pages without materializing a table.
//!
//! ## Reaching page tables
//!
//! | Directory | Paging | How tables are reached |
//! |-----------|--------|------------------------|
//! | kernel    | off    | physically, through [`Mmu::phys_to_mut`] |
//! | kernel    | on     | through the self-map window at `0x3FC0_0000` |
//! | any other | on     | one table at a time through the scratch slots, guarded by a temporary mapping |
//!
//! ## Locking
//!
//! Every directory has its own lock. Operations on a directory other than the
//! kernel's also take the kernel lock, because the scratch slots live in the
//! kernel's tables. The order is always: own lock, then kernel lock.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

mod address_space;
mod directory;
mod error;
mod flags;
pub mod page_table;
mod search;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod tables;
mod temporary;
#[cfg(test)]
mod tests;
mod vm;

pub use crate::address_space::AddressSpace;
pub use crate::directory::Directory;
pub use crate::error::VmError;
pub use crate::flags::VmFlags;
pub use crate::vm::Vm;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};

/// Source of physical 4 KiB frames.
///
/// The physical allocator implements this; the page-table code only needs
/// single frames for tables, the page-granular allocators need contiguous runs.
/// All methods take `&self`: implementations serialize internally.
pub trait FrameAlloc {
    /// Allocate `pages` physically contiguous frames, or `None` when exhausted.
    fn alloc_frames(&self, pages: u32) -> Option<PhysicalAddress>;

    /// Return `pages` frames starting at `base`.
    fn free_frames(&self, base: PhysicalAddress, pages: u32);

    /// Allocate one frame.
    #[inline]
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_frames(1).map(|pa| pa.page::<Size4K>())
    }

    /// Free one frame.
    #[inline]
    fn free_4k(&self, frame: PhysicalPage<Size4K>) {
        self.free_frames(frame.base(), 1);
    }
}

/// Memory access and paging control.
///
/// The hardware implementation dereferences identity-mapped physical
/// addresses before paging and plain virtual addresses afterwards; the
/// [`sim`] implementation models both in software.
///
/// # Safety
/// For every accessor:
/// - The target must be mapped (physically present before paging, mapped in
///   the active directory afterwards) and writable.
/// - Lifetime `'a` is not checked; the mapping must stay valid for `'a`.
/// - `T` must match the bytes at the address (no aliasing UB).
pub trait Mmu {
    /// Convert a *physical* address into a usable reference.
    ///
    /// # Safety
    /// Only valid while paging is disabled (or the frame is identity mapped).
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Convert a *virtual* address of the active directory into a usable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T;

    /// Drop any cached translation of `page`.
    fn invalidate(&self, page: VirtualPage<Size4K>);

    /// Load `directory` as the active page directory.
    ///
    /// # Safety
    /// The directory must map the code, stack and data currently in use.
    unsafe fn activate(&self, directory: PhysicalPage<Size4K>);

    /// Turn on paging.
    ///
    /// # Safety
    /// An active directory must be loaded and identity map the running code.
    unsafe fn enable_paging(&self);
}

/// A physically contiguous run of frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameRun {
    pub base: PhysicalAddress,
    pub pages: u32,
}

impl FrameRun {
    #[inline]
    #[must_use]
    pub const fn new(base: PhysicalAddress, pages: u32) -> Self {
        Self { base, pages }
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.pages * info::PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages == 0
    }
}
