//! # Hardware MMU
//!
//! The [`Mmu`] of a real i386 machine. Before paging is enabled physical
//! addresses are used as they are; afterwards the kernel only dereferences
//! virtual addresses of the active directory, and physical frames are reached
//! either through the identity map set up at boot or through a temporary
//! mapping.
//!
//! ## Example
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::X86Mmu;
//! use kernel_vmem::Mmu;
//! use kernel_vmem::page_table::PageTable;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let mmu = X86Mmu;
//! unsafe {
//!     let table: &mut PageTable = mmu.phys_to_mut(PhysicalAddress::new(0x0012_3000));
//!     table.zero();
//! }
//! ```

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe, tlb};
use kernel_vmem::Mmu;

/// [`Mmu`] backed by the CPU: plain pointers, `invlpg`, CR3 and CR0.PG.
///
/// # Safety
/// Only usable in ring 0. Physical accessors are only meaningful while paging
/// is off or for identity-mapped frames.
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

impl Mmu for X86Mmu {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = pa.as_usize() as *mut T;
        // Safety: the caller guarantees the frame is reachable at this address.
        unsafe { &mut *ptr }
    }

    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        let ptr = va.as_usize() as *mut T;
        // Safety: the caller guarantees `va` is mapped in the active directory.
        unsafe { &mut *ptr }
    }

    fn invalidate(&self, page: VirtualPage<Size4K>) {
        // Safety: the kernel runs in ring 0.
        unsafe { tlb::invalidate_page(page) }
    }

    unsafe fn activate(&self, directory: PhysicalPage<Size4K>) {
        unsafe { Cr3::from_directory(directory).store_unsafe() }
    }

    unsafe fn enable_paging(&self) {
        unsafe {
            let cr0 = Cr0::load_unsafe();
            cr0.with_pg_paging(true).store_unsafe();
        }
    }
}
