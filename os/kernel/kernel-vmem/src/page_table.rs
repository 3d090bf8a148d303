//! # Two-level Page Tables
//!
//! - [`DirectoryIndex`] / [`TableIndex`]: typed indices from VA bits `[31:22]` and `[21:12]`.
//! - [`PageEntry`]: one 32-bit entry, shared by both levels.
//! - [`PageDirectory`] / [`PageTable`]: 4 KiB-aligned arrays of 1024 entries.

pub mod entry;
pub mod pd;
pub mod pt;

use kernel_info::memory::{DIRECTORY_SHIFT, PAGE_SHIFT, TABLE_ENTRIES};
use kernel_memory_addresses::{Size4K, VirtualAddress, VirtualPage};

pub use entry::{PageEntry, PageEntryBits};
pub use pd::PageDirectory;
pub use pt::PageTable;

/// Index into the page directory (VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirectoryIndex(u16);

/// Index into a page table (VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl DirectoryIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self((va.as_u32() >> DIRECTORY_SHIFT) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(v: usize) -> Self {
        debug_assert!(v < TABLE_ENTRIES);
        Self(v as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// First virtual address covered by this slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << DIRECTORY_SHIFT)
    }
}

impl TableIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self(((va.as_u32() >> PAGE_SHIFT) & 0x3FF) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(v: usize) -> Self {
        debug_assert!(v < TABLE_ENTRIES);
        Self(v as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirectoryIndex, TableIndex) {
    (DirectoryIndex::from(va), TableIndex::from(va))
}

/// The page addressed by a directory slot and a table index.
#[inline]
#[must_use]
pub const fn join_indices(slot: DirectoryIndex, index: TableIndex) -> VirtualPage<Size4K> {
    VirtualPage::from_index(((slot.0 as u32) << 10) | index.0 as u32)
}
