//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and page bases used
//! in paging and memory management code.
//!
//! ## Overview
//!
//! This crate defines a minimal set of types that prevent mixing virtual and
//! physical addresses at compile time while remaining zero-cost wrappers around
//! `u32` values.
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | - | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory or MMIO regions. |
//!
//! ## Page Sizes
//!
//! Two granularities exist in 32-bit two-level paging:
//!
//! - [`Size4K`]: one frame, one page-table entry
//! - [`Size4M`]: the span of one directory entry (a full page table)
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0804_8123);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32(), 0x0804_8000);
//! assert_eq!(page.join(off), va);
//!
//! assert_eq!(page_count(1), 1);
//! assert_eq!(page_count(4096), 1);
//! assert_eq!(page_count(4097), 2);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use crate::memory_address::MemoryAddress;
pub use crate::memory_address_offset::MemoryAddressOffset;
pub use crate::memory_page::MemoryPage;
pub use crate::page_size::{PageSize, Size4K, Size4M};
pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_page::PhysicalPage;
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::VirtualPage;

/// Number of 4 KiB pages needed to hold `bytes` bytes.
///
/// Zero bytes need zero pages.
#[inline]
#[must_use]
pub const fn page_count(bytes: usize) -> usize {
    bytes.div_ceil(Size4K::SIZE as usize)
}

/// Align `x` down to the nearest multiple of `a` (`a` a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x12345, 4096), 0x12000);
/// assert_eq!(align_down(0x12000, 4096), 0x12000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (`a` a power of two),
/// or `None` when the result does not fit into 32 bits.
///
/// ```rust
/// # use kernel_memory_addresses::checked_align_up;
/// assert_eq!(checked_align_up(0x12345, 4096), Some(0x13000));
/// assert_eq!(checked_align_up(0x13000, 4096), Some(0x13000));
/// assert_eq!(checked_align_up(0xFFFF_F001, 4096), None);
/// ```
#[inline]
#[must_use]
pub const fn checked_align_up(x: u32, a: u32) -> Option<u32> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let a = MemoryAddress::new(0x1234_5678);
        let (p, o) = a.split::<Size4K>();
        assert_eq!(p.base().as_u32(), 0x1234_5000);
        assert_eq!(o.as_u32(), 0x678);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn split_and_join_4m() {
        let a = MemoryAddress::new(0x3FC0_1234);
        let (p, o) = a.split::<Size4M>();
        assert_eq!(p.index(), 0xFF);
        assert_eq!(o.as_u32(), 0x1234);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let va = VirtualAddress::new(0xC000_1234);
        let (vp, vo) = va.split::<Size4K>();
        assert_eq!(vp.base().as_u32(), 0xC000_1000);
        assert_eq!(vo.as_u32(), 0x234);
        assert_eq!(vp.join(vo), va);

        let pa = PhysicalAddress::new(0x0010_2042);
        let (pp, po) = pa.split::<Size4K>();
        assert_eq!(pp.index(), 0x102);
        assert_eq!(po.as_u32(), 0x42);
        assert_eq!(pp.join(po), pa);
    }

    #[test]
    fn alignment_helpers() {
        let a = MemoryAddress::new(0x12345);
        assert_eq!(a.align_down::<Size4K>().as_u32(), 0x12000);
        assert_eq!(a.checked_align_up::<Size4K>().map(MemoryAddress::as_u32), Some(0x13000));
        assert!(!a.is_aligned::<Size4K>());
        assert!(a.align_down::<Size4K>().is_aligned::<Size4K>());
        assert_eq!(MemoryAddress::new(0xFFFF_FFFF).checked_align_up::<Size4K>(), None);
    }

    #[test]
    fn forward_stops_at_the_end_of_the_address_space() {
        let last = PhysicalPage::<Size4K>::from_index(0xF_FFFF);
        assert_eq!(last.checked_forward(0), Some(last));
        assert_eq!(last.checked_forward(1), None);

        let vp = VirtualPage::<Size4K>::from_index(1);
        assert_eq!(vp.checked_forward(1023).map(VirtualPage::base), Some(VirtualAddress::new(0x40_0000)));
    }

    #[test]
    fn offsets_between_virtual_addresses() {
        let base = VirtualAddress::new(0x1000);
        assert_eq!(VirtualAddress::new(0x1010).checked_offset_from(base), Some(0x10));
        assert_eq!(VirtualAddress::new(0x0FF0).checked_offset_from(base), None);
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(page_count(0), 0);
        assert_eq!(page_count(1), 1);
        assert_eq!(page_count(8192), 2);
        assert_eq!(page_count(8193), 3);
    }
}
